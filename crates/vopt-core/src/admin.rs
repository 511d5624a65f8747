//! The admin state machine.
//!
//! Every administrative operation (load, suspend, resume, save, grow) is a
//! sequence of phases executed in order on the engine; the state machine
//! validates which operations may start from which states. Suspend that
//! lands the device in read-only mode still counts as a successful suspend.

use vopt_error::{Result, VoptError};

/// The device's administrative state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminState {
    New,
    Loading,
    /// Unclean shutdown detected; replaying journals and scrubbing.
    Recovering,
    Operating,
    Suspending,
    Suspended,
    Resuming,
    Saving,
    Growing,
    ReadOnly,
}

/// An operation the admin thread can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOperation {
    Load,
    Suspend,
    Resume,
    Save,
    GrowLogical,
    GrowPhysical,
}

/// The phases of a suspend, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPhase {
    Start,
    DrainPacker,
    DrainDataVios,
    DrainFlusher,
    DrainLogicalZones,
    DrainBlockMap,
    DrainJournal,
    DrainDepot,
    WaitReadOnly,
    WriteSuperBlock,
    End,
}

/// The suspend phase list.
#[must_use]
pub fn suspend_phases() -> &'static [SuspendPhase] {
    &[
        SuspendPhase::Start,
        SuspendPhase::DrainPacker,
        SuspendPhase::DrainDataVios,
        SuspendPhase::DrainFlusher,
        SuspendPhase::DrainLogicalZones,
        SuspendPhase::DrainBlockMap,
        SuspendPhase::DrainJournal,
        SuspendPhase::DrainDepot,
        SuspendPhase::WaitReadOnly,
        SuspendPhase::WriteSuperBlock,
        SuspendPhase::End,
    ]
}

/// Validates operation starts and records the resulting states.
#[derive(Debug)]
pub struct AdminStateMachine {
    state: AdminState,
}

impl Default for AdminStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AdminState::New,
        }
    }

    #[must_use]
    pub fn state(&self) -> AdminState {
        self.state
    }

    #[must_use]
    pub fn is_operating(&self) -> bool {
        matches!(self.state, AdminState::Operating | AdminState::ReadOnly)
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.state == AdminState::Suspended
    }

    /// Begin an operation, moving to its transient state.
    pub fn start_operation(&mut self, operation: AdminOperation) -> Result<AdminState> {
        let next = match (operation, self.state) {
            (AdminOperation::Load, AdminState::New) => AdminState::Loading,
            (AdminOperation::Suspend, AdminState::Operating | AdminState::ReadOnly) => {
                AdminState::Suspending
            }
            (AdminOperation::Resume, AdminState::Suspended) => AdminState::Resuming,
            (AdminOperation::Save, AdminState::Operating | AdminState::Suspended) => {
                AdminState::Saving
            }
            (
                AdminOperation::GrowLogical | AdminOperation::GrowPhysical,
                AdminState::Suspended,
            ) => AdminState::Growing,
            (operation, state) => {
                return Err(VoptError::InvalidAdminState(format!(
                    "{operation:?} from {state:?}"
                )))
            }
        };
        self.state = next;
        Ok(next)
    }

    /// Record the operation's terminal state.
    pub fn finish_operation(&mut self, end_state: AdminState) {
        self.state = end_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_phase_order_is_fixed() {
        let phases = suspend_phases();
        assert_eq!(phases.first(), Some(&SuspendPhase::Start));
        assert_eq!(phases.last(), Some(&SuspendPhase::End));
        let packer = phases
            .iter()
            .position(|&p| p == SuspendPhase::DrainPacker)
            .unwrap();
        let journal = phases
            .iter()
            .position(|&p| p == SuspendPhase::DrainJournal)
            .unwrap();
        let depot = phases
            .iter()
            .position(|&p| p == SuspendPhase::DrainDepot)
            .unwrap();
        assert!(packer < journal && journal < depot);
    }

    #[test]
    fn legal_lifecycle_transitions() {
        let mut admin = AdminStateMachine::new();
        admin.start_operation(AdminOperation::Load).unwrap();
        admin.finish_operation(AdminState::Operating);
        admin.start_operation(AdminOperation::Suspend).unwrap();
        admin.finish_operation(AdminState::Suspended);
        admin.start_operation(AdminOperation::GrowLogical).unwrap();
        admin.finish_operation(AdminState::Suspended);
        admin.start_operation(AdminOperation::Resume).unwrap();
        admin.finish_operation(AdminState::Operating);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut admin = AdminStateMachine::new();
        assert!(matches!(
            admin.start_operation(AdminOperation::Resume),
            Err(VoptError::InvalidAdminState(_))
        ));
        admin.start_operation(AdminOperation::Load).unwrap();
        admin.finish_operation(AdminState::Operating);
        assert!(admin.start_operation(AdminOperation::GrowLogical).is_err());
        assert!(admin.start_operation(AdminOperation::Load).is_err());
    }

    #[test]
    fn suspend_is_legal_from_read_only() {
        let mut admin = AdminStateMachine::new();
        admin.start_operation(AdminOperation::Load).unwrap();
        admin.finish_operation(AdminState::ReadOnly);
        assert!(admin.start_operation(AdminOperation::Suspend).is_ok());
    }
}
