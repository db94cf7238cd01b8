//! scoreflow-core: event model, traits and the executor for the scoreflow engine.
//!
//! Provides the pieces every other crate builds on:
//! - `GameEvent`, `Window`, `Watermark`, `Emission`, `KeyField`
//! - Traits: `Source`, `Operator`, `Sink`, `Context`, `Output`
//! - A tokio-based `Executor` wiring one source, one operator and one sink
//!
//! Quick example:
//! ```no_run
//! use scoreflow_core::{Context, Emission, GameEvent, Operator, Output, Sink, Source};
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! struct OneEvent;
//! #[async_trait::async_trait]
//! impl Source for OneEvent {
//!     async fn run(&mut self, ctx: &mut dyn Context) -> scoreflow_core::Result<()> {
//!         ctx.collect(GameEvent::new("alice", "red", 5, chrono::Utc::now()));
//!         Ok(())
//!     }
//! }
//!
//! struct Noop;
//! #[async_trait::async_trait]
//! impl Operator for Noop {
//!     async fn on_element(&mut self, _out: &mut dyn Output, _ev: GameEvent) -> scoreflow_core::Result<()> { Ok(()) }
//! }
//!
//! struct Discard;
//! #[async_trait::async_trait]
//! impl Sink for Discard {
//!     async fn on_emission(&mut self, _e: Emission) -> scoreflow_core::Result<()> { Ok(()) }
//! }
//!
//! let mut exec = scoreflow_core::Executor::new();
//! exec.source(OneEvent).operator(Noop).sink(Discard);
//! exec.run().await?;
//! # Ok(()) }
//! ```

use std::time::Instant;

use chrono::Utc;

pub mod config;
pub mod event;
pub mod metrics;

pub use config::{ConfigError, EngineConfig, PipelineConfig};
pub use event::{Emission, GameEvent, KeyField, PaneTiming, Watermark, Window};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown partition {index} (have {partitions})")]
    UnknownPartition { index: usize, partitions: usize },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Handle a source pushes events and explicit watermarks into.
pub trait Context: Send {
    fn collect(&mut self, event: GameEvent);
    fn watermark(&mut self, wm: Watermark);
    /// True once nothing downstream will read further input; unbounded sources should stop.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Receives the emissions an operator produces.
pub trait Output: Send {
    fn emit(&mut self, emission: Emission);
}

impl Output for Vec<Emission> {
    fn emit(&mut self, emission: Emission) {
        self.push(emission);
    }
}

#[async_trait::async_trait]
pub trait Source: Send {
    async fn run(&mut self, ctx: &mut dyn Context) -> Result<()>;
}

#[async_trait::async_trait]
pub trait Operator: Send {
    async fn on_element(&mut self, out: &mut dyn Output, event: GameEvent) -> Result<()>;
    async fn on_watermark(&mut self, _out: &mut dyn Output, _wm: Watermark) -> Result<()> {
        Ok(())
    }
    /// Processing-time tick, driven by the executor when a tick interval is configured.
    async fn on_tick(&mut self, _out: &mut dyn Output, _now: chrono::DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait Sink: Send {
    async fn on_emission(&mut self, emission: Emission) -> Result<()>;
    async fn on_watermark(&mut self, _wm: Watermark) -> Result<()> {
        Ok(())
    }
    /// Called once after the input is exhausted.
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

enum Message {
    Event(GameEvent),
    Watermark(Watermark),
}

pub struct Executor {
    source: Option<Box<dyn Source>>,
    operator: Option<Box<dyn Operator>>,
    sink: Option<Box<dyn Sink>>,
    tick: Option<std::time::Duration>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            source: None,
            operator: None,
            sink: None,
            tick: None,
        }
    }

    pub fn source<S: Source + 'static>(&mut self, s: S) -> &mut Self {
        self.source = Some(Box::new(s));
        self
    }

    pub fn operator<O: Operator + 'static>(&mut self, o: O) -> &mut Self {
        self.operator = Some(Box::new(o));
        self
    }

    pub fn sink<K: Sink + 'static>(&mut self, s: K) -> &mut Self {
        self.sink = Some(Box::new(s));
        self
    }

    /// Drive `Operator::on_tick` at this wall-clock cadence.
    pub fn tick_every(&mut self, every: std::time::Duration) -> &mut Self {
        self.tick = Some(every);
        self
    }

    pub async fn run(&mut self) -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();

        struct ExecCtx {
            tx: tokio::sync::mpsc::UnboundedSender<Message>,
        }

        impl Context for ExecCtx {
            fn collect(&mut self, event: GameEvent) {
                if self.tx.send(Message::Event(event)).is_ok() {
                    metrics::QUEUE_DEPTH.inc();
                }
            }
            fn watermark(&mut self, wm: Watermark) {
                if self.tx.send(Message::Watermark(wm)).is_ok() {
                    metrics::QUEUE_DEPTH.inc();
                }
            }
            fn is_closed(&self) -> bool {
                self.tx.is_closed()
            }
        }

        let mut source = self.source.take().ok_or_else(|| anyhow::anyhow!("no source"))?;
        let mut op = self.operator.take().ok_or_else(|| anyhow::anyhow!("no operator"))?;
        let mut sink = self.sink.take().ok_or_else(|| anyhow::anyhow!("no sink"))?;
        let tick = self.tick;

        // Source task
        let mut sctx = ExecCtx { tx: tx.clone() };
        let src_handle = tokio::spawn(async move { source.run(&mut sctx).await });
        // Drop our sender so that when the source is done, channel closes and the operator task can finish
        drop(tx);

        let op_handle = tokio::spawn(async move {
            let mut ticker = tick.map(tokio::time::interval);
            let mut out: Vec<Emission> = Vec::new();
            loop {
                let mut passed_wm = None;
                tokio::select! {
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        metrics::QUEUE_DEPTH.dec();
                        let started = Instant::now();
                        match msg {
                            Message::Event(ev) => op.on_element(&mut out, ev).await?,
                            Message::Watermark(wm) => {
                                op.on_watermark(&mut out, wm).await?;
                                passed_wm = Some(wm);
                            }
                        }
                        metrics::OP_PROC_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
                    }
                    _ = next_tick(&mut ticker) => {
                        op.on_tick(&mut out, Utc::now()).await?;
                    }
                }
                for emission in out.drain(..) {
                    let started = Instant::now();
                    sink.on_emission(emission).await?;
                    metrics::SINK_PROC_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
                }
                if let Some(wm) = passed_wm {
                    sink.on_watermark(wm).await?;
                }
            }
            sink.flush().await?;
            Ok::<_, Error>(())
        });

        let op_result = op_handle.await.map_err(|e| Error::Anyhow(anyhow::anyhow!(e)))?;
        if let Err(e) = &op_result {
            tracing::warn!(error = %e, "operator failed, aborting source");
            src_handle.abort();
            return op_result;
        }
        src_handle.await.map_err(|e| Error::Anyhow(anyhow::anyhow!(e)))??;
        Ok(())
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

pub mod prelude {
    pub use super::{
        Context, Emission, EngineConfig, Executor, GameEvent, KeyField, Operator, Output, PaneTiming, Result, Sink,
        Source, Watermark, Window,
    };
}
