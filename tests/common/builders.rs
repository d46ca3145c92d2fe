//! Test data builders for creating test objects

use usrecon_rs::probe::ProbeDefinition;
use usrecon_rs::types::{ToolKind, TrackedTool, Transform3D};

/// Builder for creating test probe tools
pub struct ProbeToolBuilder {
    id: String,
    probe: Option<ProbeDefinition>,
    calibration: Transform3D,
}

impl ProbeToolBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            probe: Some(ProbeDefinition::linear([16.0, 0.0], 0.0, 16.0, 16.0)),
            calibration: Transform3D::from_translation(0.0, 0.0, 1.0),
        }
    }

    pub fn probe(mut self, probe: ProbeDefinition) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn without_geometry(mut self) -> Self {
        self.probe = None;
        self
    }

    pub fn calibration(mut self, calibration: Transform3D) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn build(self) -> TrackedTool {
        let tool = TrackedTool::new(self.id, ToolKind::Probe).with_calibration(self.calibration);
        match self.probe {
            Some(probe) => tool.with_probe(probe),
            None => tool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_tool_builder() {
        let tool = ProbeToolBuilder::new("probe").build();
        assert_eq!(tool.id, "probe");
        assert!(tool.is_valid_probe());

        let bare = ProbeToolBuilder::new("probe").without_geometry().build();
        assert!(!bare.is_valid_probe());
    }
}
