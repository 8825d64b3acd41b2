//! Exit-code taxonomy for spawned node processes
//!
//! Every failure class a broker or client agent can hit maps to its own
//! nonzero exit code so the orchestrator (and anyone reading logs) can tell
//! *what* died from the exit status alone. Broker-side codes live in 11-19,
//! client-side codes in 21-29; 10 is reserved for argument failures where
//! the role could not even be determined.

/// Exit codes for the `mb-node` process, one per failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeExit {
    /// Full success
    Success,
    /// Arguments so malformed the role is unknown
    Usage,

    // Broker-side failures
    BrokerArgs,
    BrokerSocket,
    BrokerDescriptor,
    BrokerCreate,
    BrokerStart,
    BrokerSetup,
    BrokerRun,
    BrokerLink,
    BrokerConnect,

    // Client-side failures
    ClientArgs,
    ClientSocket,
    ClientDescriptor,
    ClientSetup,
    ClientStart,
    ClientRun,
    ClientCleanup,
    ClientDiary,
    ClientTransfer,
}

impl NodeExit {
    /// The process exit status for this failure class.
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Usage => 10,

            Self::BrokerArgs => 11,
            Self::BrokerSocket => 12,
            Self::BrokerDescriptor => 13,
            Self::BrokerCreate => 14,
            Self::BrokerStart => 15,
            Self::BrokerSetup => 16,
            Self::BrokerRun => 17,
            Self::BrokerLink => 18,
            Self::BrokerConnect => 19,

            Self::ClientArgs => 21,
            Self::ClientSocket => 22,
            Self::ClientDescriptor => 23,
            Self::ClientSetup => 24,
            Self::ClientStart => 25,
            Self::ClientRun => 26,
            Self::ClientCleanup => 27,
            Self::ClientDiary => 28,
            Self::ClientTransfer => 29,
        }
    }

    /// Human label for a nonzero exit status observed by the monitor.
    pub fn describe(code: i32) -> &'static str {
        match code {
            0 => "success",
            10 => "bad arguments (role unknown)",
            11 => "broker: bad arguments",
            12 => "broker: control socket failure",
            13 => "broker: descriptor not received",
            14 => "broker: engine create failed",
            15 => "broker: engine start failed",
            16 => "broker: setup failed",
            17 => "broker: run failed",
            18 => "broker: link instruction failure",
            19 => "broker: neighbour connect failed",
            21 => "client: bad arguments",
            22 => "client: control socket failure",
            23 => "client: descriptor not received",
            24 => "client: setup failed",
            25 => "client: start signal failure",
            26 => "client: workload run failed",
            27 => "client: cleanup failed",
            28 => "client: diary write failed",
            29 => "client: diary transfer failed",
            _ => "unknown failure",
        }
    }
}
