//! Automation rules — what to do, for whom, and on what trigger.

pub mod model;

pub use model::{
    AnchorEvent, Automation, AutomationKind, AutomationStep, BusinessEventType, BusinessTrigger,
    ClockTime, Content, DelaySpec, Scope,
};
