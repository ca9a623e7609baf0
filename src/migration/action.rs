//! # Migration Action State Machine
//!
//! Pure evaluation of what migration work a Lead queue should perform next,
//! based on three monotonically non-decreasing version markers.

use serde::Serialize;

/// Minimum migration version below which a database counts as uninitialized.
pub const DEFAULT_MIGRATION_THRESHOLD: i64 = 1000;

/// The three version markers tracked per database.
///
/// `available` is the highest script version discoverable from the migration
/// source; `loaded` the highest version whose statements have been produced
/// and staged; `applied` the highest version committed to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationMarkers {
    pub available: i64,
    pub loaded: i64,
    pub applied: i64,
}

impl MigrationMarkers {
    pub fn new(available: i64, loaded: i64, applied: i64) -> Self {
        Self {
            available,
            loaded,
            applied,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationAction {
    None,
    Load,
    Apply,
}

/// Decide the next migration action.
///
/// Evaluated in order: up to date, uninitialized database, newer scripts
/// available, loaded but unapplied.
pub fn determine_action(markers: MigrationMarkers, threshold: i64) -> MigrationAction {
    let MigrationMarkers {
        available,
        loaded,
        applied,
    } = markers;

    if available == applied {
        return MigrationAction::None;
    }
    if available >= threshold && loaded < threshold {
        return MigrationAction::Load;
    }
    if available >= threshold && loaded < available {
        return MigrationAction::Load;
    }
    if loaded > applied {
        return MigrationAction::Apply;
    }
    MigrationAction::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const THRESHOLD: i64 = DEFAULT_MIGRATION_THRESHOLD;

    #[test]
    fn empty_database_loads() {
        let action = determine_action(MigrationMarkers::new(1000, 0, 0), THRESHOLD);
        assert_eq!(action, MigrationAction::Load);
    }

    #[test]
    fn up_to_date_is_none() {
        let action = determine_action(MigrationMarkers::new(1000, 1000, 1000), THRESHOLD);
        assert_eq!(action, MigrationAction::None);
    }

    #[test]
    fn newer_scripts_load() {
        let action = determine_action(MigrationMarkers::new(2000, 1000, 1000), THRESHOLD);
        assert_eq!(action, MigrationAction::Load);
    }

    #[test]
    fn loaded_but_unapplied_applies() {
        let action = determine_action(MigrationMarkers::new(1000, 1000, 0), THRESHOLD);
        assert_eq!(action, MigrationAction::Apply);
    }

    #[test]
    fn below_threshold_is_none() {
        let action = determine_action(MigrationMarkers::new(500, 500, 500), THRESHOLD);
        assert_eq!(action, MigrationAction::None);
    }

    proptest! {
        // Load is only ever chosen when the source actually holds scripts at
        // or past the threshold.
        #[test]
        fn load_implies_initialized_source(
            available in 0i64..5000,
            loaded in 0i64..5000,
            applied in 0i64..5000,
        ) {
            let action = determine_action(
                MigrationMarkers::new(available, loaded, applied),
                THRESHOLD,
            );
            if action == MigrationAction::Load {
                prop_assert!(available >= THRESHOLD);
                prop_assert!(loaded < available || loaded < THRESHOLD);
            }
        }

        // Once markers agree the system is quiescent.
        #[test]
        fn equal_markers_are_quiescent(version in 0i64..5000) {
            let action = determine_action(
                MigrationMarkers::new(version, version, version),
                THRESHOLD,
            );
            prop_assert_eq!(action, MigrationAction::None);
        }
    }
}
