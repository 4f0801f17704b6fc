use bitflags::bitflags;

bitflags! {
    /// Lifecycle word shared by requests, tasks and loopers.
    ///
    /// A unit's state is a *pattern* over these bits: READY means
    /// `STARTED | READY`, a terminal outcome means `DONE` plus one of the
    /// outcome bits, and so on. All predicates are plain mask tests, which
    /// lets an outcome bit be preset before DONE — the skip path that makes
    /// `execute` bypass the user body and go straight to post dispatch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct State: u32 {
        /// Posted or claimed by a scheduler; prerequisite for every later bit.
        const STARTED = 0x0200_0000;
        /// Passed the prepare gate; eligible to run. Meaningful together
        /// with STARTED — alone it marks the transient preparing shape.
        const READY = 0x0100_0000;
        /// Inside user code right now.
        const RUNNING = 0x0400_0000;
        /// Terminal. Once set, only POST_FAILED may still be added and no
        /// bit is ever cleared.
        const DONE = 0x8000_0000;
        /// Cancellation observed.
        const CANCELED = 0x0800_0000;
        /// Primary body completed without error.
        const SUCCESS = 0x1000_0000;
        /// Primary body failed.
        const FAILED = 0x2000_0000;
        /// Post body or post handler failed; independent of SUCCESS/FAILED.
        const POST_FAILED = 0x4000_0000;
    }
}

impl State {
    pub fn is_started(self) -> bool {
        self.contains(Self::STARTED)
    }

    /// The full READY pattern: started and prepared.
    pub fn is_ready(self) -> bool {
        self.contains(Self::STARTED | Self::READY)
    }

    pub fn is_running(self) -> bool {
        self.contains(Self::RUNNING)
    }

    pub fn is_done(self) -> bool {
        self.contains(Self::DONE)
    }

    pub fn is_canceled(self) -> bool {
        self.contains(Self::CANCELED)
    }

    /// True as soon as the SUCCESS bit is present, which can be *before*
    /// DONE when the bit was preset to skip the body. Outcome readers should
    /// check `is_done() && is_success()`.
    pub fn is_success(self) -> bool {
        self.contains(Self::SUCCESS)
    }

    pub fn is_failed(self) -> bool {
        self.contains(Self::FAILED)
    }

    pub fn is_post_failed(self) -> bool {
        self.contains(Self::POST_FAILED)
    }

    /// Neither running nor terminal: the shape queue entries must have.
    pub fn is_waiting(self) -> bool {
        !self.is_running() && !self.is_done()
    }

    /// A preset outcome that makes `execute` bypass the user body.
    pub fn has_skip_bit(self) -> bool {
        self.intersects(Self::SUCCESS | Self::FAILED)
    }
}
