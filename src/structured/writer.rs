//! Batches typed commands per display and layer

use super::message::{DisplayCommand, LayerCommand};
use crate::hal::{DisplayId, LayerId};

#[derive(Debug, Default)]
pub struct ComposerClientWriter {
    commands: Vec<DisplayCommand>,
}

impl ComposerClientWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.commands.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[DisplayCommand] {
        &self.commands
    }

    /// Hand the batch to the transport, leaving the writer empty
    pub fn take_pending_commands(&mut self) -> Vec<DisplayCommand> {
        std::mem::take(&mut self.commands)
    }

    /// The command for `display`, extending the last one when it matches
    pub fn display_command(&mut self, display: DisplayId) -> &mut DisplayCommand {
        let extend = self.commands.last().is_some_and(|c| c.display == display);
        if !extend {
            self.commands.push(DisplayCommand::new(display));
        }
        let last = self.commands.len() - 1;
        &mut self.commands[last]
    }

    pub fn layer_command(&mut self, display: DisplayId, layer: LayerId) -> &mut LayerCommand {
        let command = self.display_command(display);
        let extend = command.layers.last().is_some_and(|l| l.layer == layer);
        if !extend {
            command.layers.push(LayerCommand { layer, ..Default::default() });
        }
        let last = command.layers.len() - 1;
        &mut command.layers[last]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_target_extends_command() {
        let mut w = ComposerClientWriter::new();
        w.layer_command(1, 10).plane_alpha = Some(0.5);
        w.layer_command(1, 10).z = Some(2);
        w.display_command(1).validate_display = true;

        assert_eq!(w.commands().len(), 1);
        assert_eq!(w.commands()[0].layers.len(), 1);
        assert_eq!(w.commands()[0].layers[0].z, Some(2));
        assert!(w.commands()[0].is_flush());
    }

    #[test]
    fn test_new_target_starts_command() {
        let mut w = ComposerClientWriter::new();
        w.layer_command(1, 10).z = Some(1);
        w.layer_command(1, 11).z = Some(2);
        w.layer_command(2, 10).z = Some(3);
        w.layer_command(1, 10).z = Some(4);

        let displays: Vec<_> = w.commands().iter().map(|c| c.display).collect();
        assert_eq!(displays, vec![1, 2, 1]);
        assert_eq!(w.commands()[0].layers.len(), 2);

        let taken = w.take_pending_commands();
        assert_eq!(taken.len(), 3);
        assert!(w.is_empty());
    }
}
