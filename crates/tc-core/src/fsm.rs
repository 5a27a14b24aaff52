//! Port state machine.
//!
//! A transparent clock port only ever moves through a small corner of the
//! 1588 state space: it comes up, listens, and bounces through FAULTY or
//! DISABLED on link or transport trouble. The full set of states still
//! exists because TC egress eligibility is defined over all of them.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    Initializing,
    Faulty,
    Disabled,
    Listening,
    PreMaster,
    Master,
    Passive,
    Uncalibrated,
    Slave,
    GrandMaster,
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PortState::Initializing => "INITIALIZING",
            PortState::Faulty => "FAULTY",
            PortState::Disabled => "DISABLED",
            PortState::Listening => "LISTENING",
            PortState::PreMaster => "PRE_MASTER",
            PortState::Master => "MASTER",
            PortState::Passive => "PASSIVE",
            PortState::Uncalibrated => "UNCALIBRATED",
            PortState::Slave => "SLAVE",
            PortState::GrandMaster => "GRAND_MASTER",
        };
        f.write_str(s)
    }
}

/// Events fed to [`transition`] by the per-port dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEvent {
    None,
    InitComplete,
    FaultDetected,
    FaultCleared,
    DesignatedEnabled,
    DesignatedDisabled,
}

impl std::fmt::Display for FsmEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FsmEvent::None => "NONE",
            FsmEvent::InitComplete => "INIT_COMPLETE",
            FsmEvent::FaultDetected => "FAULT_DETECTED",
            FsmEvent::FaultCleared => "FAULT_CLEARED",
            FsmEvent::DesignatedEnabled => "DESIGNATED_ENABLED",
            FsmEvent::DesignatedDisabled => "DESIGNATED_DISABLED",
        };
        f.write_str(s)
    }
}

/// Computes the next state. Returns the current state unchanged when the
/// event does not apply.
pub fn transition(state: PortState, event: FsmEvent) -> PortState {
    use FsmEvent::*;
    use PortState::*;

    match event {
        None => state,
        DesignatedDisabled => Disabled,
        DesignatedEnabled => {
            if state == Disabled {
                Initializing
            } else {
                state
            }
        }
        FaultDetected => {
            // DISABLED outranks FAULTY; only DESIGNATED_ENABLED leaves it.
            if state == Disabled {
                state
            } else {
                Faulty
            }
        }
        FaultCleared => {
            if state == Faulty {
                Initializing
            } else {
                state
            }
        }
        InitComplete => {
            if state == Initializing {
                Listening
            } else {
                state
            }
        }
    }
}
