// Workflow event model
//
// The `on` block of a workflow is an ordered list. A mapping entry is a cron
// schedule; a bare string names another workflow whose completion releases
// this one. Load-time rules: at most 10 schedules per block, one shared
// timezone, every cron string must parse.

use serde::{Deserialize, Serialize};

use crate::cron::{CronEvaluator, CronSchedule};
use crate::error::{CoreError, Result};

/// Maximum number of cron schedules in one event block.
pub const MAX_SCHEDULES: usize = 10;

/// One entry of the `on` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OnEntry {
    /// Release when another workflow of this name reaches a terminal status
    Workflow(String),
    /// Release at cron fire times
    Schedule(CronSchedule),
}

/// Ordered event configuration attached to a workflow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct On {
    pub entries: Vec<OnEntry>,
}

impl On {
    /// The cron schedules, in declaration order.
    pub fn schedules(&self) -> impl Iterator<Item = &CronSchedule> {
        self.entries.iter().filter_map(|e| match e {
            OnEntry::Schedule(s) => Some(s),
            OnEntry::Workflow(_) => None,
        })
    }

    /// The release-on-workflow names, in declaration order.
    pub fn release_on(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| match e {
            OnEntry::Workflow(name) => Some(name.as_str()),
            OnEntry::Schedule(_) => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compile every schedule, enforcing the event-block rules.
    pub fn compile(&self, default_tz: &str) -> Result<Vec<CronEvaluator>> {
        let schedules: Vec<&CronSchedule> = self.schedules().collect();
        if schedules.len() > MAX_SCHEDULES {
            return Err(CoreError::schedule(format!(
                "event block has {} schedules, at most {MAX_SCHEDULES} allowed",
                schedules.len()
            )));
        }
        let mut shared_tz: Option<&str> = None;
        for sched in &schedules {
            let tz = sched.timezone.as_deref().unwrap_or(default_tz);
            match shared_tz {
                None => shared_tz = Some(tz),
                Some(prev) if prev != tz => {
                    return Err(CoreError::schedule(format!(
                        "event block mixes timezones {prev:?} and {tz:?}"
                    )));
                }
                Some(_) => {}
            }
        }
        schedules
            .iter()
            .map(|sched| sched.evaluator(default_tz))
            .collect()
    }
}
