//! Scriptable capability doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;

use crate::capability::{
    CapabilityError, MoistureReading, NotificationSink, NotifyCategory, PumpCapability,
    SensorCapability,
};

// -- Sensor ------------------------------------------------------------------

pub struct MockSensor {
    reading: Mutex<Result<MoistureReading, CapabilityError>>,
    reads: AtomicUsize,
    hangs: bool,
}

impl MockSensor {
    pub fn reading(percent: f32, at: OffsetDateTime) -> Arc<Self> {
        Arc::new(Self {
            reading: Mutex::new(Ok(MoistureReading { percent, at })),
            reads: AtomicUsize::new(0),
            hangs: false,
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            reading: Mutex::new(Err(CapabilityError::Unavailable("no reading".into()))),
            reads: AtomicUsize::new(0),
            hangs: false,
        })
    }

    /// Every read blocks forever.
    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            reading: Mutex::new(Err(CapabilityError::Unavailable("no reading".into()))),
            reads: AtomicUsize::new(0),
            hangs: true,
        })
    }

    pub fn set(&self, percent: f32, at: OffsetDateTime) {
        *self.reading.lock().unwrap() = Ok(MoistureReading { percent, at });
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl SensorCapability for MockSensor {
    async fn read_moisture(&self) -> Result<MoistureReading, CapabilityError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.hangs {
            std::future::pending::<()>().await;
        }
        self.reading.lock().unwrap().clone()
    }
}

// -- Pump --------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum PumpBehavior {
    Confirms,
    /// Reports OFF for the first `n - 1` state reads.
    ConfirmsAfterPolls(usize),
    /// Accepts commands, hardware never reports ON.
    NeverConfirms,
    RejectsOn,
    /// Every command blocks forever.
    Hangs,
}

pub struct MockPump {
    behavior: PumpBehavior,
    self_timing: bool,
    on: AtomicBool,
    polls: AtomicUsize,
    commands: Mutex<Vec<bool>>,
}

impl MockPump {
    pub fn new(behavior: PumpBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            self_timing: false,
            on: AtomicBool::new(false),
            polls: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        })
    }

    pub fn new_self_timing(behavior: PumpBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            self_timing: true,
            on: AtomicBool::new(false),
            polls: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        })
    }

    pub fn commands(&self) -> Vec<bool> {
        self.commands.lock().unwrap().clone()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn is_on_now(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

impl PumpCapability for MockPump {
    async fn set_state(&self, on: bool) -> Result<(), CapabilityError> {
        if matches!(self.behavior, PumpBehavior::Hangs) {
            std::future::pending::<()>().await;
        }
        self.commands.lock().unwrap().push(on);
        match self.behavior {
            PumpBehavior::RejectsOn if on => {
                return Err(CapabilityError::Unavailable("relay offline".into()))
            }
            PumpBehavior::NeverConfirms if on => {}
            _ => self.on.store(on, Ordering::SeqCst),
        }
        Ok(())
    }

    async fn is_on(&self) -> Result<bool, CapabilityError> {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if let PumpBehavior::ConfirmsAfterPolls(n) = self.behavior {
            if polls < n {
                return Ok(false);
            }
        }
        Ok(self.on.load(Ordering::SeqCst))
    }

    fn self_timing(&self) -> bool {
        self.self_timing
    }
}

// -- Notifications -----------------------------------------------------------

#[derive(Default)]
pub struct MockNotifier {
    sent: Mutex<Vec<(NotifyCategory, String)>>,
    fail: bool,
    hangs: bool,
}

impl MockNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
            hangs: false,
        })
    }

    /// Every send blocks forever.
    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail: false,
            hangs: true,
        })
    }

    pub fn sent(&self) -> Vec<(NotifyCategory, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, category: NotifyCategory) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == category)
            .count()
    }
}

impl NotificationSink for MockNotifier {
    async fn send(&self, category: NotifyCategory, message: &str) -> Result<(), CapabilityError> {
        self.sent.lock().unwrap().push((category, message.to_string()));
        if self.hangs {
            std::future::pending::<()>().await;
        }
        if self.fail {
            return Err(CapabilityError::Unavailable("notify service down".into()));
        }
        Ok(())
    }
}
