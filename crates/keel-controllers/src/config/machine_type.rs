use async_trait::async_trait;
use keel_resources::config::MachineType;
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output};

use super::{active_machine_config, machine_config_input};

/// Publishes the machine role from the machine configuration.
#[derive(Debug, Default)]
pub struct MachineTypeController;

#[async_trait]
impl Controller for MachineTypeController {
    fn name(&self) -> &str {
        "config.MachineTypeController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![machine_config_input()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<MachineType>()]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                ev = r.event() => {
                    if ev.is_none() {
                        return Ok(());
                    }
                }
            }

            let kind = active_machine_config(r)?
                .map(|cfg| cfg.machine.kind)
                .unwrap_or_default();

            r.modify::<MachineType, _>(MachineType::ID, |mt| {
                mt.kind = kind;
                Ok(())
            })?;
        }
    }
}
