use std::collections::HashMap;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};
use crate::ids::{ColumnId, TaskId};
use crate::models::Column;
use crate::reorder::positions_are_dense;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoardInvariantViolation {
    ColumnPositionsNotDense,
    TaskPositionsNotDense { column_id: ColumnId },
    TaskInMultipleColumns { task_id: TaskId },
    TaskColumnMismatch { task_id: TaskId, column_id: ColumnId },
}

impl BoardInvariantViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            BoardInvariantViolation::ColumnPositionsNotDense => "board_column_positions",
            BoardInvariantViolation::TaskPositionsNotDense { .. } => "board_task_positions",
            BoardInvariantViolation::TaskInMultipleColumns { .. } => "board_task_duplicated",
            BoardInvariantViolation::TaskColumnMismatch { .. } => "board_task_column_mismatch",
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            BoardInvariantViolation::ColumnPositionsNotDense => {
                "Column positions must be a contiguous 0..n-1 sequence"
            }
            BoardInvariantViolation::TaskPositionsNotDense { .. } => {
                "Task positions must be a contiguous 0..n-1 sequence"
            }
            BoardInvariantViolation::TaskInMultipleColumns { .. } => {
                "A task must belong to exactly one column"
            }
            BoardInvariantViolation::TaskColumnMismatch { .. } => {
                "Task column reference does not match its column"
            }
        }
    }
}

/// Columns are expected in display order.
pub fn board_invariant_violations(columns: &[Column]) -> Vec<BoardInvariantViolation> {
    let mut violations = Vec::new();
    if !positions_are_dense(columns) {
        violations.push(BoardInvariantViolation::ColumnPositionsNotDense);
    }

    let mut seen: HashMap<TaskId, ColumnId> = HashMap::new();
    for column in columns {
        if !positions_are_dense(&column.tasks) {
            violations.push(BoardInvariantViolation::TaskPositionsNotDense {
                column_id: column.id,
            });
        }
        for task in &column.tasks {
            if task.column_id != column.id {
                violations.push(BoardInvariantViolation::TaskColumnMismatch {
                    task_id: task.id,
                    column_id: column.id,
                });
            }
            if seen.insert(task.id, column.id).is_some() {
                violations.push(BoardInvariantViolation::TaskInMultipleColumns { task_id: task.id });
            }
        }
    }

    violations
}

pub fn ensure_board_invariants(columns: &[Column]) -> Result<()> {
    let violations = board_invariant_violations(columns);
    if let Some(first) = violations.first() {
        return Err(LibError::validation_with_code(
            first.error_code(),
            first.public_message(),
            anyhow!("board invariant validation failed: {:?}", violations),
        ));
    }

    Ok(())
}
