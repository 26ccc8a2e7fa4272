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

//! # notemilld
//!
//! The notemill daemon: ranked, personalized note timelines over HTTP.
//!
//! notemilld is container-first: it runs in the foreground, logs to stdout (JSON by default,
//! human-readable with `--plain`), exposes Prometheus metrics on `/metrics`, and re-reads its
//! configuration on `SIGHUP`. The few command-line options it accepts govern where to find the
//! configuration file and how to log before that file has been parsed; they all have environment
//! variable mirrors for the sake of convenience when running in a container.

use std::{
    env,
    future::IntoFuture,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use axum::{extract::State, response::IntoResponse, routing::get, Router};
use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use http::{HeaderName, HeaderValue};
use opentelemetry::{global, KeyValue};
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};

use notemill::{
    admission,
    api::{health, make_ops_router, make_router},
    cache,
    config::TimelineConfig,
    fanout,
    metrics::check_metric_names,
    notemill::{Builder, Notemill},
    storage::Memory,
};

/// The notemilld application error type
///
/// Contra the usual approach of a module error type with a few big buckets, the application level
/// offers a fairly rich set of errors in the hope of helping operators. [Debug] is implemented by
/// hand via [Display] so that `main()`'s error path prints something a human wants to read.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// notemill configuration, version one
#[derive(Clone, Debug, Deserialize)]
struct ConfigV1 {
    /// Local address for the public API
    #[serde(rename = "public-address")]
    public_address: SocketAddr,
    /// Local address for the ops surface (write-event callbacks); bind this privately
    #[serde(rename = "ops-address")]
    ops_address: SocketAddr,
    /// Shared auth token required of callers, if set
    #[serde(rename = "shared-token")]
    shared_token: Option<String>,
    /// Default timeline parameters; viewers & requests overlay these
    #[serde(rename = "timeline-defaults", default)]
    timeline_defaults: TimelineConfig,
    #[serde(rename = "cache", default)]
    cache: cache::Config,
    #[serde(rename = "admission", default)]
    admission: admission::Config,
    #[serde(rename = "fanout", default)]
    fanout: fanout::Config,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            public_address: "0.0.0.0:20780".parse::<SocketAddr>().unwrap(/* known good */),
            ops_address: "127.0.0.1:20781".parse::<SocketAddr>().unwrap(/* known good */),
            shared_token: None,
            timeline_defaults: TimelineConfig::default(),
            cache: cache::Config::default(),
            admission: admission::Config::default(),
            fanout: fanout::Config::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the notemill configuration file; a missing file at the *default* path falls back to
/// defaults, a missing file the operator asked for by name is an error.
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str("/etc/notemill.toml").unwrap(), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(Configuration::V1(cfg)) => Ok(cfg),
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          telemetry                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Initialize metrics. Must be invoked before any instrument is touched; returns an exporter that
/// backs the `/metrics` endpoint.
fn init_telemetry() -> PrometheusExporter {
    check_metric_names();
    let exporter = PrometheusExporter::new();
    let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_attribute(KeyValue::new("service.name", "notemill"))
                .build(),
        )
        .with_reader(exporter.clone())
        .build();
    global::set_meter_provider(provider);
    exporter
}

struct Shared {
    state: Arc<Notemill>,
    exporter: PrometheusExporter,
}

async fn metrics(State(shared): State<Arc<Shared>>) -> String {
    let mut output = Vec::new();
    shared
        .exporter
        .export(&mut output)
        .expect("Failed to encode Prom metrics");
    String::from_utf8(output).expect("Non UTF-8 Prom exporter response?")
}

async fn healthcheck(State(shared): State<Arc<Shared>>) -> axum::response::Response {
    health(State(shared.state.clone())).await.into_response()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Counter for generating request IDs; a u64 carries less entropy than the traditional UUID, but
/// it's readable in logs and doubles as a gauge of how long the server's been up.
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
            .pipe(|s| RequestId::new(HeaderValue::from_str(&s).unwrap(/* known good */)))
            .pipe(Some)
    }
}

/// Make the [Router] that will be accessible to the world
fn make_world_router(state: Arc<Notemill>, exporter: PrometheusExporter) -> Router {
    let shared = Arc::new(Shared {
        state: state.clone(),
        exporter,
    });
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .with_state(shared)
        .nest("/api/v1", make_router(state))
        .layer(CorsLayer::permissive())
        // Incoming requests must hit SetRequestIdLayer *first*, so it's the outermost layer.
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            RequestIdGenerator::default(),
        ))
}

/// Make the [Router] that will only be locally accessible
fn make_local_router(state: Arc<Notemill>) -> Router {
    Router::new()
        .nest("/ops", make_ops_router(state))
        .layer(TraceLayer::new_for_http())
}

/// Serve notemill API requests
#[tracing::instrument(skip(cli_config))]
async fn serve(cli_config: Option<PathBuf>) -> Result<()> {
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    let mut sighup = signal(SignalKind::hangup()).unwrap();
    let mut sigterm = signal(SignalKind::terminate()).unwrap();

    let exporter = init_telemetry();
    let mut cfg = parse_config(&cli_config)?;

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        // The single-process deployment runs on the in-memory backend; sibling services feed it
        // through the ops surface.
        let memory = Arc::new(Memory::new());
        let state = Arc::new(
            Builder {
                notes: memory.clone(),
                graph: memory.clone(),
                prefs: memory.clone(),
                remote_cache: None,
                overdrive: None,
                defaults: cfg.timeline_defaults.clone().sanitize(),
                cache_config: cfg.cache.clone(),
                admission_config: cfg.admission.clone(),
                fanout_config: cfg.fanout.clone(),
                shared_token: cfg.shared_token.clone(),
            }
            .build(),
        );

        let processor = fanout::spawn(
            state.fanout.clone(),
            fanout::Context {
                graph: memory.clone(),
                cache: state.pipeline.cache().clone(),
                registry: state.registry.clone(),
            },
            cfg.fanout.clone(),
            state.instruments.clone(),
        );

        let world_nfy = Arc::new(Notify::new());
        let local_nfy = Arc::new(Notify::new());

        let world_server = axum::serve(
            TcpListener::bind(cfg.public_address)
                .await
                .context(BindSnafu {
                    addr: cfg.public_address,
                })?,
            make_world_router(state.clone(), exporter.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(world_nfy.clone()));

        let local_server = axum::serve(
            TcpListener::bind(cfg.ops_address).await.context(BindSnafu {
                addr: cfg.ops_address,
            })?,
            make_local_router(state.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(local_nfy.clone()));

        info!(
            "notemill listening on {} (ops on {})",
            cfg.public_address, cfg.ops_address
        );

        let mut world_server = world_server.into_future();
        let mut local_server = local_server.into_future();

        fn log_on_err<T, E>(x: StdResult<T, E>)
        where
            E: std::fmt::Debug,
        {
            if let Err(err) = x {
                error!("{:?}", err);
            }
        }

        let (mut processor_join_handle, processor_shutdown) = processor.into_parts();

        tokio::select! {
            // The servers should never exit on their own, but they must be polled.
            _ = &mut world_server => unimplemented!(),
            _ = &mut local_server => unimplemented!(),
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                state.registry.close_all();
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                processor_shutdown.notify_one();
                log_on_err(tokio::time::timeout(
                    std::time::Duration::from_secs(5),
                    processor_join_handle,
                ).await);
                // Fall back to the last known-good configuration on a parse failure.
                cfg = match parse_config(&cli_config) {
                    Ok(new_cfg) => new_cfg,
                    Err(err) => {
                        error!("Failed to re-read configuration ({err}); keeping the old one");
                        cfg
                    }
                };
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                state.registry.close_all();
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                processor_shutdown.notify_one();
                match tokio::time::timeout(
                    std::time::Duration::from_secs(5),
                    &mut processor_join_handle,
                ).await {
                    Ok(Err(err)) => error!("Failed to shut down the fan-out worker: {:?}", err),
                    Err(err) => error!("Timed out waiting for the fan-out worker: {:?}", err),
                    _ => (),
                };
                break;
            }
            res = &mut processor_join_handle => {
                // This shouldn't happen!
                error!("The fan-out worker exited early with {:?}; shutting down.", res);
                state.registry.close_all();
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                break;
            }
        } // End tokio::select!.
    } // End loop.

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct LogOpts {
    plain: bool,
    level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

fn configure_logging(opts: &LogOpts) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(opts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;
    // `json()` & `compact()` produce layers of different types, hence the box
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if opts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(std::io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(std::io::stdout),
        )
    };
    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)
}

fn main() -> Result<()> {
    let matches = Command::new("notemilld")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Ranked, personalized note timelines")
        .long_about("notemilld assembles ranked, personalized timelines of short-form notes.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .env("NOTEMILL_CONFIG")
                .help(
                    "path (absolute or relative to the process' current directory) to a \
                       configuration file",
                ),
        )
        .arg(
            Arg::new("debug")
                .short('D')
                .long("debug")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("NOTEMILL_DEBUG")
                .help("produce debug output"),
        )
        .arg(
            Arg::new("plain")
                .short('p')
                .long("plain")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("NOTEMILL_PLAIN")
                .help("log in human-readable format, not JSON/structured logging"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("NOTEMILL_QUIET")
                .help("produce only error output"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("NOTEMILL_VERBOSE")
                .help("produce prolix output"),
        )
        .get_matches();

    let log_opts = LogOpts::new(&matches);
    configure_logging(&log_opts)?;

    let here = env::current_dir().ok();
    let cli_config = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .map(|p| here.map(|h| h.join(&p)).unwrap_or(p));

    info!("notemill version {} starting.", crate_version!());

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(serve(cli_config))
}
