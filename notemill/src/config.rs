// Copyright (C) 2025 The notemill authors
//
// This file is part of notemill.
//
// notemill is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// notemill is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with notemill.  If not,
// see <http://www.gnu.org/licenses/>.

//! # timeline configuration
//!
//! Every request is served under a [TimelineConfig], resolved in three layers: crate defaults,
//! then the viewer's stored [TimelinePreferences] (only positive values override), then
//! [RequestOverrides] parsed from request headers. The config is a plain value; nothing here is
//! shared or locked.

use serde::{Deserialize, Serialize};

use crate::entities::ContentSource;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Algorithm                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Algorithm {
    Chronological,
    #[default]
    Hybrid,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     per-source value tables                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One value per [ContentSource]; used for mix ratios, caps & A/B multipliers
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct PerSource<T> {
    pub following: T,
    pub recommended: T,
    pub trending: T,
    pub lists: T,
}

impl<T: Copy> PerSource<T> {
    pub fn get(&self, source: ContentSource) -> T {
        match source {
            ContentSource::Following => self.following,
            ContentSource::Recommended => self.recommended,
            ContentSource::Trending => self.trending,
            ContentSource::Lists => self.lists,
        }
    }
    pub fn set(&mut self, source: ContentSource, value: T) {
        match source {
            ContentSource::Following => self.following = value,
            ContentSource::Recommended => self.recommended = value,
            ContentSource::Trending => self.trending = value,
            ContentSource::Lists => self.lists = value,
        }
    }
    pub fn uniform(value: T) -> PerSource<T> {
        PerSource {
            following: value,
            recommended: value,
            trending: value,
            lists: value,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         SignalWeights                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Weights for the scorer's weighted sum, plus the diversity shaping multiplier
///
/// These sum to roughly 1 by convention, but nothing enforces it; the scorer is linear in them.
/// `diversity` does not enter the weighted sum at all: it multiplies the diversity-shaping
/// adjustment applied after scoring.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct SignalWeights {
    pub recency: f64,
    pub engagement: f64,
    pub author_affinity: f64,
    pub content_quality: f64,
    pub diversity: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        SignalWeights {
            recency: 0.3,
            engagement: 0.25,
            author_affinity: 0.2,
            content_quality: 0.15,
            diversity: 0.1,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         TimelineConfig                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The fully-resolved, per-request timeline configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TimelineConfig {
    pub algorithm: Algorithm,
    pub max_items: usize,
    pub max_age_hours: i64,
    pub min_score_threshold: f64,
    pub weights: SignalWeights,
    /// Source mix ratios; sum to 1 by convention
    pub mix: PerSource<f64>,
    /// Absolute per-source caps on items contributed to one assembled timeline
    pub caps: PerSource<usize>,
    /// A/B multipliers applied to per-source quotas
    pub ab_weights: PerSource<f64>,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        TimelineConfig {
            algorithm: Algorithm::Hybrid,
            max_items: 50,
            max_age_hours: 24,
            min_score_threshold: 0.1,
            weights: SignalWeights::default(),
            mix: PerSource {
                following: 0.7,
                recommended: 0.2,
                trending: 0.08,
                lists: 0.02,
            },
            caps: PerSource {
                following: 100,
                recommended: 50,
                trending: 30,
                lists: 20,
            },
            ab_weights: PerSource::uniform(1.0),
        }
    }
}

impl TimelineConfig {
    /// Replace non-positive size controls, weights, ratios & multipliers with their defaults.
    ///
    /// The invariant downstream code relies on: after `sanitize()`, ratios ≥ 0, weights ≥ 0,
    /// caps ≥ 0 (trivially, they're unsigned) and the size controls are positive.
    pub fn sanitize(mut self) -> TimelineConfig {
        let dflt = TimelineConfig::default();
        if self.max_items == 0 {
            self.max_items = dflt.max_items;
        }
        if self.max_age_hours <= 0 {
            self.max_age_hours = dflt.max_age_hours;
        }
        if self.min_score_threshold < 0.0 {
            self.min_score_threshold = dflt.min_score_threshold;
        }
        let fix = |x: f64, d: f64| if x < 0.0 || !x.is_finite() { d } else { x };
        self.weights.recency = fix(self.weights.recency, dflt.weights.recency);
        self.weights.engagement = fix(self.weights.engagement, dflt.weights.engagement);
        self.weights.author_affinity =
            fix(self.weights.author_affinity, dflt.weights.author_affinity);
        self.weights.content_quality =
            fix(self.weights.content_quality, dflt.weights.content_quality);
        self.weights.diversity = fix(self.weights.diversity, dflt.weights.diversity);
        for source in ContentSource::ALL {
            self.mix
                .set(source, fix(self.mix.get(source), dflt.mix.get(source)));
            self.ab_weights.set(
                source,
                fix(self.ab_weights.get(source), dflt.ab_weights.get(source)),
            );
        }
        self
    }
    /// The per-source fetch quota: `floor(max_items · ratio · ab_weight)`, clipped by the cap
    pub fn quota(&self, source: ContentSource) -> usize {
        let q = (self.max_items as f64 * self.mix.get(source) * self.ab_weights.get(source))
            .floor() as usize;
        std::cmp::min(q, self.caps.get(source))
    }
    pub fn effective_cap(&self, source: ContentSource) -> usize {
        self.caps.get(source)
    }
    /// Scale the non-following ratios so they sum to `share` (clamped to [0, 1]) while following
    /// takes the remainder. Zero-sum discovery mixes degrade to an even three-way split.
    pub fn apply_discovery_share(&mut self, share: f64) {
        let share = share.clamp(0.0, 1.0);
        let discovery = self.mix.recommended + self.mix.trending + self.mix.lists;
        if discovery > 0.0 {
            let scale = share / discovery;
            self.mix.recommended *= scale;
            self.mix.trending *= scale;
            self.mix.lists *= scale;
        } else {
            self.mix.recommended = share / 3.0;
            self.mix.trending = share / 3.0;
            self.mix.lists = share / 3.0;
        }
        self.mix.following = 1.0 - share;
    }
    /// The Following entry point: chronological, follows only
    pub fn following_only(mut self) -> TimelineConfig {
        self.algorithm = Algorithm::Chronological;
        self.mix = PerSource {
            following: 1.0,
            recommended: 0.0,
            trending: 0.0,
            lists: 0.0,
        };
        self
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      TimelinePreferences                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Stored per-viewer preferences; a sparse overlay on the default config
///
/// Only positive values override (a stored zero or negative is treated as "no preference"), so a
/// half-filled preferences row can never zero-out a weight by accident.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TimelinePreferences {
    pub algorithm: Option<Algorithm>,
    pub max_items: Option<usize>,
    pub max_age_hours: Option<i64>,
    pub min_score_threshold: Option<f64>,
    pub recency_weight: Option<f64>,
    pub engagement_weight: Option<f64>,
    pub author_affinity_weight: Option<f64>,
    pub content_quality_weight: Option<f64>,
    pub diversity_weight: Option<f64>,
    pub following_ratio: Option<f64>,
    pub recommended_ratio: Option<f64>,
    pub trending_ratio: Option<f64>,
    pub lists_ratio: Option<f64>,
}

fn overlay_f64(slot: &mut f64, pref: Option<f64>) {
    if let Some(v) = pref {
        if v > 0.0 && v.is_finite() {
            *slot = v;
        }
    }
}

impl TimelinePreferences {
    pub fn apply_to(&self, config: &mut TimelineConfig) {
        if let Some(algorithm) = self.algorithm {
            config.algorithm = algorithm;
        }
        if let Some(n) = self.max_items {
            if n > 0 {
                config.max_items = n;
            }
        }
        if let Some(h) = self.max_age_hours {
            if h > 0 {
                config.max_age_hours = h;
            }
        }
        overlay_f64(&mut config.min_score_threshold, self.min_score_threshold);
        overlay_f64(&mut config.weights.recency, self.recency_weight);
        overlay_f64(&mut config.weights.engagement, self.engagement_weight);
        overlay_f64(
            &mut config.weights.author_affinity,
            self.author_affinity_weight,
        );
        overlay_f64(
            &mut config.weights.content_quality,
            self.content_quality_weight,
        );
        overlay_f64(&mut config.weights.diversity, self.diversity_weight);
        overlay_f64(&mut config.mix.following, self.following_ratio);
        overlay_f64(&mut config.mix.recommended, self.recommended_ratio);
        overlay_f64(&mut config.mix.trending, self.trending_ratio);
        overlay_f64(&mut config.mix.lists, self.lists_ratio);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       RequestOverrides                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Per-request overrides, parsed from headers
///
/// Every field is optional; unknown headers were already ignored upstream. `discovery_share` is
/// honored only by the For-You entry point.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestOverrides {
    pub ab_weights: PerSource<Option<f64>>,
    pub caps: PerSource<Option<usize>>,
    pub discovery_share: Option<f64>,
    pub use_overdrive: bool,
}

impl RequestOverrides {
    pub fn apply_to(&self, config: &mut TimelineConfig) {
        for source in ContentSource::ALL {
            if let Some(w) = self.ab_weights.get(source) {
                if w >= 0.0 && w.is_finite() {
                    config.ab_weights.set(source, w);
                }
            }
            if let Some(cap) = self.caps.get(source) {
                config.caps.set(source, cap);
            }
        }
    }
}

impl<T> Default for PerSource<Option<T>> {
    fn default() -> Self {
        PerSource {
            following: None,
            recommended: None,
            trending: None,
            lists: None,
        }
    }
}

/// Resolve the effective config for one request: defaults ∪ stored preferences ∪ overrides.
pub fn resolve(
    defaults: &TimelineConfig,
    prefs: Option<&TimelinePreferences>,
    overrides: &RequestOverrides,
) -> TimelineConfig {
    let mut config = defaults.clone();
    if let Some(prefs) = prefs {
        prefs.apply_to(&mut config);
    }
    overrides.apply_to(&mut config);
    config.sanitize()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sanitize_restores_defaults() {
        let mut cfg = TimelineConfig::default();
        cfg.max_items = 0;
        cfg.weights.recency = -1.0;
        cfg.mix.trending = f64::NAN;
        let cfg = cfg.sanitize();
        assert_eq!(cfg.max_items, 50);
        assert_eq!(cfg.weights.recency, 0.3);
        assert_eq!(cfg.mix.trending, 0.08);
    }

    #[test]
    fn quotas_respect_caps() {
        let mut cfg = TimelineConfig::default();
        // 50 · 0.7 · 1.0 = 35
        assert_eq!(cfg.quota(ContentSource::Following), 35);
        cfg.caps.following = 2;
        assert_eq!(cfg.quota(ContentSource::Following), 2);
    }

    #[test]
    fn preferences_only_positive_values_override() {
        let mut cfg = TimelineConfig::default();
        TimelinePreferences {
            recency_weight: Some(-0.5),
            engagement_weight: Some(0.4),
            ..Default::default()
        }
        .apply_to(&mut cfg);
        assert_eq!(cfg.weights.recency, 0.3);
        assert_eq!(cfg.weights.engagement, 0.4);
    }

    #[test]
    fn discovery_share_holds_the_sum() {
        let mut cfg = TimelineConfig::default();
        cfg.apply_discovery_share(0.5);
        let discovery = cfg.mix.recommended + cfg.mix.trending + cfg.mix.lists;
        assert!((discovery - 0.5).abs() < 1e-9);
        assert!((cfg.mix.following - 0.5).abs() < 1e-9);
        // Relative proportions among the discovery sources are preserved
        assert!(cfg.mix.recommended > cfg.mix.trending);
        assert!(cfg.mix.trending > cfg.mix.lists);
    }

    #[test]
    fn following_only_is_chronological() {
        let cfg = TimelineConfig::default().following_only();
        assert_eq!(cfg.algorithm, Algorithm::Chronological);
        assert_eq!(cfg.mix.following, 1.0);
        assert_eq!(cfg.quota(ContentSource::Recommended), 0);
    }

    #[test]
    fn override_caps_apply() {
        let overrides = RequestOverrides {
            caps: PerSource {
                following: Some(2),
                ..Default::default()
            },
            ..Default::default()
        };
        let cfg = resolve(&TimelineConfig::default(), None, &overrides);
        assert_eq!(cfg.effective_cap(ContentSource::Following), 2);
    }
}
