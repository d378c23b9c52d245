//! AFK component.
//!
//! Runs the [`Detector`] and turns its presence changes into daemon events.

use std::convert::Infallible;
use std::future;

use eyre::Result;
use tally_common::settings;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    afk::{Detector, HookRegisterer},
    daemon::{Component, DaemonHandle},
    events::DaemonEvent,
    observer::RelayEnd,
};

pub struct AfkComponent {
    detector: Detector,
    enabled: bool,
    relay: Option<(CancellationToken, JoinHandle<()>)>,
}

impl AfkComponent {
    pub fn new(settings: &settings::Afk, registerers: Vec<Box<dyn HookRegisterer>>) -> Self {
        Self {
            detector: Detector::from_settings(settings, registerers),
            enabled: settings.enabled,
            relay: None,
        }
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }
}

#[tonic::async_trait]
impl Component for AfkComponent {
    fn name(&self) -> &'static str {
        "afk"
    }

    async fn start(&mut self, handle: DaemonHandle) -> Result<()> {
        if !self.enabled {
            tracing::info!("afk detection disabled");
            return Ok(());
        }

        let relay = self.detector.subscribe();
        let token = CancellationToken::new();
        let cancel = token.clone();
        let task = tokio::spawn(async move {
            let end = relay
                .run(cancel.cancelled(), |event| {
                    handle.emit(DaemonEvent::from(event));
                    future::ready(Ok::<_, Infallible>(()))
                })
                .await;

            match end {
                Ok(RelayEnd::Closed) => tracing::debug!("afk detector closed its subscriptions"),
                Ok(RelayEnd::Cancelled) => {}
                Err(never) => match never {},
            }
        });
        self.relay = Some((token, task));

        // A detector that fails to start leaves the rest of the daemon running.
        if let Err(e) = self.detector.start_detecting().await {
            tracing::warn!(error = %e, "could not start afk detection, continuing without it");
        }

        tracing::info!("afk component started");
        Ok(())
    }

    async fn handle_event(&mut self, _event: &DaemonEvent) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let stopped = if self.enabled {
            self.detector.stop_detecting().await
        } else {
            Ok(())
        };

        if let Some((token, task)) = self.relay.take() {
            token.cancel();
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "afk relay ended abnormally");
            }
        }

        tracing::info!("afk component stopped");
        stopped.map_err(Into::into)
    }
}
