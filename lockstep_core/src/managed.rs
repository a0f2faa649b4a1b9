//! The managed application role.
//!
//! A managed application hosts its own simulator and follows the manager's
//! commands. It never receives ticks over the network: a start command only
//! carries the epoch pair and scale, and the local kernel paces itself from
//! them.

use crate::application::Application;
use crate::commands::{CommandHandlers, StatusRoutes};
use crate::config::ManagedConfig;
use crate::error::ApplicationError;
use crate::publishers::ShutDownObserver;
use crate::schemas::{decode_status, ModeStatus, TimeStatus};
use crate::simulator::{ExecutionSummary, Simulator};
use crate::topics::{StatusKind, Topics};
use chrono::TimeDelta;
use lockstep_env::Envelope;
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct ManagedApplication {
    app: Application,
    config: ManagedConfig,
    handlers: Arc<CommandHandlers>,
}

impl ManagedApplication {
    pub fn new(app: Application, config: ManagedConfig) -> Self {
        let status = StatusRoutes {
            channel: app.status_channel(),
            time: app.topics().app_status(app.name(), StatusKind::Time),
            mode: app.topics().app_status(app.name(), StatusKind::Mode),
            ready: Some(app.topics().app_status(app.name(), StatusKind::Ready)),
        };
        let mut handlers = CommandHandlers::new(app.simulator().clone(), config.handler_settings())
            .with_status(status);
        if config.shut_down_when_terminated {
            handlers = handlers.with_start_observer(Arc::new(ShutDownObserver::new(app.shut_down_hook())));
        }
        Self {
            app,
            config,
            handlers: Arc::new(handlers),
        }
    }

    pub fn app(&self) -> &Application {
        &self.app
    }

    pub fn simulator(&self) -> &Arc<Simulator> {
        self.app.simulator()
    }

    pub fn handlers(&self) -> &Arc<CommandHandlers> {
        &self.handlers
    }

    /// Corrects the wallclock and subscribes to everything the manager
    /// publishes.
    pub async fn start_up(&self) -> Result<TimeDelta, ApplicationError> {
        let offset = self.app.start_up(&self.config.offset).await?;
        let handlers = self.handlers.clone();
        let name = self.app.name().to_string();
        self.app.subscribe(
            &self.app.topics().manager_all(&self.config.manager),
            Arc::new(move |envelope: &Envelope| dispatch(&name, &handlers, envelope)),
        )?;
        Ok(offset)
    }

    /// Waits for the execution started by the last start command.
    pub async fn join(&self) -> Result<ExecutionSummary, ApplicationError> {
        match self.handlers.join().await {
            Some(result) => Ok(result?),
            None => Err(ApplicationError::NotStarted(self.app.name().to_string())),
        }
    }

    pub fn shut_down(&self) {
        self.app.shut_down();
    }
}

/// Routes one manager message by the last word of its routing key.
fn dispatch(name: &str, handlers: &CommandHandlers, envelope: &Envelope) {
    let body = envelope.payload.as_str();
    let outcome = match Topics::last_word(&envelope.routing_key) {
        "init" => handlers.init(body).map(|_| ()),
        "start" => handlers.start(body).map(|_| ()),
        "stop" => handlers.stop(body).map(|_| ()),
        "update" => handlers.update(body).map(|_| ()),
        "time" => {
            log_drift(name, handlers.simulator(), body);
            Ok(())
        }
        "mode" => {
            if let Ok(status) = decode_status::<ModeStatus>(body) {
                debug!("{}: manager is {}", name, status.properties.mode);
            }
            Ok(())
        }
        other => {
            debug!("{}: ignoring manager message on '{}'", name, other);
            Ok(())
        }
    };
    if let Err(e) = outcome {
        error!("{}: {} (routing key {})", name, e, envelope.routing_key);
    }
}

fn log_drift(name: &str, simulator: &Simulator, body: &str) {
    match decode_status::<TimeStatus>(body) {
        Ok(status) => {
            let scenario = simulator.time() - status.properties.sim_time;
            let wallclock = simulator.wallclock_time() - status.properties.time;
            info!(
                "{} drift from manager: {} ms (scenario), {} ms (wallclock)",
                name,
                scenario.num_milliseconds(),
                wallclock.num_milliseconds()
            );
        }
        Err(e) => error!("{}: bad manager time status: {}", name, e),
    }
}
