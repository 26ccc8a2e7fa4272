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

//! # notemill metrics
//!
//! notemill uses [OpenTelemetry] to collect & export metrics. OTel wants instruments created once
//! and reused, which raises the question of where to keep them; I'd rather not litter the state
//! type with dozens of `Counter<u64>` fields. Instead, metric names are *registered* at their use
//! site via David Tolnay's [inventory] crate, and either materialized lazily as statics (see
//! [define_metric]) or pre-built into an [Instruments] map handed to long-running workers. The
//! [check_metric_names] function runs at startup and panics on a name registered twice; a
//! duplicate is a logic error that would be a compile error in a richer type system.
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//! [inventory]: https://docs.rs/inventory/latest/inventory/index.html

use std::collections::{hash_map::Entry, HashMap, HashSet};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge},
    KeyValue,
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
    /// Corresponds to `Gauge<f64>`
    FloatGauge,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// The thing being inventoried. Register a metric by name & type with
///
/// ```ignore
/// inventory::submit! { metrics::Registration::new("pipeline.requests", Sort::IntegralCounter) }
/// ```
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> String {
        self.name.to_string()
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Panic if any metric name was registered twice; call once at startup, before building
/// instruments.
pub fn check_metric_names() {
    let mut names: HashSet<String> = HashSet::new();
    IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
        if !names.insert(reg.name()) {
            panic!("The metric name {} was registered twice", reg.name());
        }
    });
}

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeF64(Gauge<f64>),
    GaugeU64(Gauge<u64>),
}

/// Container for pre-built OTel instruments
///
/// Pre-creating every registered instrument risks building things that may never be used, but it
/// means `add` and `record` don't require `&mut self`, so an instance can live in an `Arc` on the
/// application state.
pub struct Instruments {
    map: HashMap<String, Instrument>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let mut m: HashMap<String, Instrument> = HashMap::new();
        let meter = global::meter(prefix);
        IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
            let name = reg.name();
            match m.entry(reg.name()) {
                Entry::Occupied(_) => panic!("The metric name {} was used twice", name),
                Entry::Vacant(vacant) => {
                    vacant.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(name).build())
                        }
                        Sort::FloatGauge => Instrument::GaugeF64(meter.f64_gauge(name).build()),
                        Sort::IntegralGauge => Instrument::GaugeU64(meter.u64_gauge(name).build()),
                    });
                }
            }
        });
        Instruments { map: m }
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::CounterU64(c)) = self.map.get(name) {
            c.add(count, attributes);
        } else {
            panic!("{} does not name a counter", name);
        }
    }
    pub fn recordf(&self, name: &str, value: f64, attributes: &[KeyValue]) {
        if let Some(Instrument::GaugeF64(g)) = self.map.get(name) {
            g.record(value, attributes);
        } else {
            panic!("{} does not name a gauge", name);
        }
    }
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::GaugeU64(g)) = self.map.get(name) {
            g.record(value, attributes);
        } else {
            panic!("{} does not name a gauge", name);
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs);
    };
}

/// Register a metric name *and* declare a lazily-built static instrument for it, in one shot:
///
/// ```ignore
/// define_metric! { "admission.rejections", admission_rejections, Sort::IntegralCounter }
/// // ...
/// admission_rejections.add(1, &[]);
/// ```
///
/// The static materializes on first touch, which is guaranteed to be after the meter provider is
/// installed as long as no handler runs before telemetry init.
#[macro_export]
macro_rules! define_metric {
    ($name:expr, $ident:ident, Sort::IntegralCounter) => {
        inventory::submit! { $crate::metrics::Registration::new($name, $crate::metrics::Sort::IntegralCounter) }
        #[allow(non_upper_case_globals)]
        static $ident: std::sync::LazyLock<opentelemetry::metrics::Counter<u64>> =
            std::sync::LazyLock::new(|| {
                opentelemetry::global::meter("notemill").u64_counter($name).build()
            });
    };
    ($name:expr, $ident:ident, Sort::IntegralGauge) => {
        inventory::submit! { $crate::metrics::Registration::new($name, $crate::metrics::Sort::IntegralGauge) }
        #[allow(non_upper_case_globals)]
        static $ident: std::sync::LazyLock<opentelemetry::metrics::Gauge<u64>> =
            std::sync::LazyLock::new(|| {
                opentelemetry::global::meter("notemill").u64_gauge($name).build()
            });
    };
    ($name:expr, $ident:ident, Sort::FloatGauge) => {
        inventory::submit! { $crate::metrics::Registration::new($name, $crate::metrics::Sort::FloatGauge) }
        #[allow(non_upper_case_globals)]
        static $ident: std::sync::LazyLock<opentelemetry::metrics::Gauge<f64>> =
            std::sync::LazyLock::new(|| {
                opentelemetry::global::meter("notemill").f64_gauge($name).build()
            });
    };
}
