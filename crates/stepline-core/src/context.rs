// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance execution context handed to stages.

use std::sync::Arc;

use crate::value::ParamMap;

/// Which way an instance is moving through its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Running stages in order.
    #[default]
    Forward,
    /// Compensating stages in reverse order.
    Undo,
}

impl Direction {
    /// Returns the string representation of the direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Undo => "undo",
        }
    }

    /// Parse a direction from its stored form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "forward" => Some(Self::Forward),
            "undo" => Some(Self::Undo),
            _ => None,
        }
    }
}

/// Data visible to a stage while it runs.
///
/// Input parameters are shared and read-only. The working map is owned by the
/// single worker driving the instance, so stages mutate it without locking.
#[derive(Debug, Clone)]
pub struct StageContext {
    instance_id: String,
    workflow_type: String,
    input: Arc<ParamMap>,
    working: ParamMap,
    direction: Direction,
    stage_index: usize,
    attempt: u32,
}

impl StageContext {
    /// Create a context positioned before the first stage.
    pub fn new(
        instance_id: impl Into<String>,
        workflow_type: impl Into<String>,
        input: Arc<ParamMap>,
        working: ParamMap,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            workflow_type: workflow_type.into(),
            input,
            working,
            direction: Direction::Forward,
            stage_index: 0,
            attempt: 1,
        }
    }

    /// The instance id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The registered workflow type name.
    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// Input parameters fixed at submission.
    pub fn input_parameters(&self) -> &ParamMap {
        &self.input
    }

    /// Values written by earlier stages.
    pub fn working_map(&self) -> &ParamMap {
        &self.working
    }

    /// Mutable access for writing outputs.
    pub fn working_map_mut(&mut self) -> &mut ParamMap {
        &mut self.working
    }

    /// Current direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Index of the stage currently executing.
    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    /// 1-based attempt number for the current action. Resets after a restart.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn set_position(&mut self, stage_index: usize, direction: Direction, attempt: u32) {
        self.stage_index = stage_index;
        self.direction = direction;
        self.attempt = attempt;
    }

    pub(crate) fn into_working_map(self) -> ParamMap {
        self.working
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_roundtrip() {
        for direction in [Direction::Forward, Direction::Undo] {
            assert_eq!(Direction::parse(direction.as_str()), Some(direction));
        }
        assert_eq!(Direction::parse("sideways"), None);
    }

    #[test]
    fn test_working_map_is_writable_and_input_is_shared() {
        let input = Arc::new(ParamMap::new().with("dataset_id", "d-1"));
        let mut ctx = StageContext::new("inst-1", "dataset.create", input.clone(), ParamMap::new());

        ctx.working_map_mut().put("staging_table", "st_1");

        assert_eq!(ctx.working_map().get_str("staging_table").unwrap(), "st_1");
        assert_eq!(ctx.input_parameters().get_str("dataset_id").unwrap(), "d-1");
        assert_eq!(Arc::strong_count(&input), 2);
        assert_eq!(ctx.attempt(), 1);
        assert_eq!(ctx.direction(), Direction::Forward);
    }
}
