use anyhow::anyhow;

use crate::error::{LibError, Result};
use crate::models::{Column, Task};

/// Parking offset for a row that is mid-move in persistent storage. Anything at
/// or above it is never a committed position.
pub const TEMPORARY_POSITION_OFFSET: i32 = 1_000_000;

pub trait Positioned {
    fn position(&self) -> i32;
    fn set_position(&mut self, position: i32);
}

impl Positioned for Task {
    fn position(&self) -> i32 {
        self.position
    }

    fn set_position(&mut self, position: i32) {
        self.position = position;
    }
}

impl Positioned for Column {
    fn position(&self) -> i32 {
        self.position
    }

    fn set_position(&mut self, position: i32) {
        self.position = position;
    }
}

/// Re-derives dense 0-based positions from slice order.
pub fn reassign_positions<T: Positioned>(items: &mut [T]) {
    for (index, item) in items.iter_mut().enumerate() {
        item.set_position(index as i32);
    }
}

pub fn positions_are_dense<T: Positioned>(items: &[T]) -> bool {
    items
        .iter()
        .enumerate()
        .all(|(index, item)| item.position() == index as i32)
}

pub fn is_noop_move(same_column: bool, source_index: usize, destination_index: usize) -> bool {
    same_column && source_index == destination_index
}

pub fn clamp_insert_index(index: usize, len: usize) -> usize {
    index.min(len)
}

pub fn move_within<T: Positioned>(
    items: &mut Vec<T>,
    source_index: usize,
    destination_index: usize,
) -> Result<()> {
    if source_index >= items.len() {
        return Err(index_error("Source index is out of range", source_index, items.len()));
    }
    if destination_index >= items.len() {
        return Err(index_error(
            "Destination index is out of range",
            destination_index,
            items.len(),
        ));
    }

    let item = items.remove(source_index);
    items.insert(destination_index, item);
    reassign_positions(items);
    Ok(())
}

/// Moves one item between two sequences. Both are re-numbered; on error neither
/// is touched.
pub fn move_across<T: Positioned>(
    source: &mut Vec<T>,
    destination: &mut Vec<T>,
    source_index: usize,
    destination_index: usize,
) -> Result<()> {
    if source_index >= source.len() {
        return Err(index_error("Source index is out of range", source_index, source.len()));
    }
    if destination_index > destination.len() {
        return Err(index_error(
            "Destination index is out of range",
            destination_index,
            destination.len(),
        ));
    }

    let item = source.remove(source_index);
    reassign_positions(source);
    destination.insert(destination_index, item);
    reassign_positions(destination);
    Ok(())
}

fn index_error(public: &'static str, index: usize, len: usize) -> LibError {
    LibError::validation_with_code(
        "move_index_out_of_range",
        public,
        anyhow!("index {} outside sequence of length {}", index, len),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Card {
        name: &'static str,
        position: i32,
    }

    impl Positioned for Card {
        fn position(&self) -> i32 {
            self.position
        }

        fn set_position(&mut self, position: i32) {
            self.position = position;
        }
    }

    fn cards(names: &[&'static str]) -> Vec<Card> {
        names
            .iter()
            .enumerate()
            .map(|(index, name)| Card {
                name: *name,
                position: index as i32,
            })
            .collect()
    }

    fn names(items: &[Card]) -> Vec<&'static str> {
        items.iter().map(|card| card.name).collect()
    }

    #[test]
    fn move_within_to_front_renumbers_everything() {
        let mut column = cards(&["T1", "T2", "T3"]);
        move_within(&mut column, 2, 0).expect("move should succeed");
        assert_eq!(names(&column), ["T3", "T1", "T2"]);
        assert!(positions_are_dense(&column));
    }

    #[test]
    fn move_within_to_back() {
        let mut column = cards(&["T1", "T2", "T3", "T4"]);
        move_within(&mut column, 0, 3).expect("move should succeed");
        assert_eq!(names(&column), ["T2", "T3", "T4", "T1"]);
        assert!(positions_are_dense(&column));
    }

    #[test]
    fn move_across_renumbers_both_sides() {
        let mut todo = cards(&["T1", "T2"]);
        let mut done = cards(&["T3"]);
        move_across(&mut todo, &mut done, 0, 1).expect("move should succeed");
        assert_eq!(names(&todo), ["T2"]);
        assert_eq!(names(&done), ["T3", "T1"]);
        assert!(positions_are_dense(&todo) && positions_are_dense(&done));
    }

    #[test]
    fn move_across_into_empty_column() {
        let mut todo = cards(&["T1"]);
        let mut done = Vec::new();
        move_across(&mut todo, &mut done, 0, 0).expect("move should succeed");
        assert!(todo.is_empty());
        assert_eq!(done[0].position, 0);
    }

    #[test]
    fn out_of_range_moves_leave_input_untouched() {
        let mut todo = cards(&["T1", "T2"]);
        let mut done = cards(&["T3"]);
        let before = (todo.clone(), done.clone());

        let err = move_across(&mut todo, &mut done, 0, 5).expect_err("bad destination");
        assert_eq!(err.code, "move_index_out_of_range");
        assert!(move_within(&mut todo, 2, 0).is_err());
        assert!(move_within(&mut todo, 0, 2).is_err());
        assert_eq!((todo, done), before);
    }

    #[test]
    fn noop_detection_only_applies_within_one_column() {
        assert!(is_noop_move(true, 1, 1));
        assert!(!is_noop_move(false, 1, 1));
        assert!(!is_noop_move(true, 1, 2));
    }

    #[test]
    fn gapped_positions_are_detected_and_repaired() {
        let mut column = cards(&["A", "B", "C"]);
        column[1].position = 5;
        assert!(!positions_are_dense(&column));
        reassign_positions(&mut column);
        assert!(positions_are_dense(&column));
    }
}
