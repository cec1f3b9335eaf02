// Job specifications: trigger rules, matrix strategy, runs-on capability
//
// The strategy expander is pure: equal specs expand to equal ordered combo
// lists, and strategy keys are stable short digests so a combo lands in the
// same context slot across runs.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::stage::Stage;
use crate::status::Status;

/// Predicate over upstream terminal statuses gating a downstream job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    #[default]
    AllSuccess,
    AllFailed,
    AllDone,
    OneSuccess,
    OneFailed,
    NoneFailed,
    NoneSkipped,
}

/// Outcome of evaluating a trigger rule against current upstream statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDecision {
    /// Dependencies allow the job to run
    Proceed,
    /// Dependencies settle the job as skipped without running it
    Skip,
    /// Not enough upstreams are terminal yet
    Wait,
}

impl Rule {
    /// Evaluate this rule. `upstream` holds the current status of every job
    /// named in `needs` (WAIT for jobs that are not terminal yet). Zero
    /// upstreams proceed vacuously for every rule.
    pub fn evaluate(&self, upstream: &[Status]) -> RuleDecision {
        if upstream.is_empty() {
            return RuleDecision::Proceed;
        }
        let terminals: Vec<Status> = upstream.iter().copied().filter(Status::is_terminal).collect();
        let all_terminal = terminals.len() == upstream.len();
        let count = |st: Status| terminals.iter().filter(|&&t| t == st).count();

        match self {
            Rule::AllSuccess => {
                if terminals.iter().any(|t| *t != Status::Success) {
                    RuleDecision::Skip
                } else if all_terminal {
                    RuleDecision::Proceed
                } else {
                    RuleDecision::Wait
                }
            }
            Rule::AllFailed => {
                if terminals.iter().any(|t| *t != Status::Failed) {
                    RuleDecision::Skip
                } else if all_terminal {
                    RuleDecision::Proceed
                } else {
                    RuleDecision::Wait
                }
            }
            Rule::AllDone => {
                if all_terminal {
                    RuleDecision::Proceed
                } else {
                    RuleDecision::Wait
                }
            }
            Rule::OneSuccess => {
                if !all_terminal {
                    RuleDecision::Wait
                } else if count(Status::Success) >= 1 {
                    RuleDecision::Proceed
                } else {
                    RuleDecision::Skip
                }
            }
            Rule::OneFailed => {
                if !all_terminal {
                    RuleDecision::Wait
                } else if count(Status::Failed) >= 1 {
                    RuleDecision::Proceed
                } else {
                    RuleDecision::Skip
                }
            }
            Rule::NoneFailed => {
                if count(Status::Failed) > 0 {
                    RuleDecision::Skip
                } else if all_terminal {
                    RuleDecision::Proceed
                } else {
                    RuleDecision::Wait
                }
            }
            Rule::NoneSkipped => {
                if count(Status::Skip) > 0 {
                    RuleDecision::Skip
                } else if all_terminal {
                    RuleDecision::Proceed
                } else {
                    RuleDecision::Wait
                }
            }
        }
    }
}

/// Execution capability a job requests. Only `local` ships here; the other
/// variants keep the same synchronous return contract and are pluggable.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunsOn {
    #[default]
    Local,
    SelfHosted {
        #[serde(default)]
        with: Value,
    },
    Docker {
        #[serde(default)]
        with: Value,
    },
    CloudBatch {
        #[serde(default)]
        with: Value,
    },
}

impl RunsOn {
    pub fn kind(&self) -> &'static str {
        match self {
            RunsOn::Local => "local",
            RunsOn::SelfHosted { .. } => "self_hosted",
            RunsOn::Docker { .. } => "docker",
            RunsOn::CloudBatch { .. } => "cloud_batch",
        }
    }
}

/// Matrix strategy of a job.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Strategy {
    /// Value lists crossed in key insertion order
    #[serde(default)]
    pub matrix: IndexMap<String, Vec<Value>>,
    /// Extra combos appended after exclusion
    #[serde(default)]
    pub include: Vec<IndexMap<String, Value>>,
    /// Key-subset patterns removed from the cross product
    #[serde(default)]
    pub exclude: Vec<IndexMap<String, Value>>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,
}

fn default_max_parallel() -> usize {
    1
}

fn default_fail_fast() -> bool {
    true
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            matrix: IndexMap::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            max_parallel: default_max_parallel(),
            fail_fast: default_fail_fast(),
        }
    }
}

/// One point of a job's matrix expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct Combo {
    /// Stable short digest of the sorted (key, value) pairs
    pub key: String,
    pub values: IndexMap<String, Value>,
}

/// Digest for one combo: sha256 over sorted `key=value` pairs, 8 hex chars.
fn strategy_key(values: &IndexMap<String, Value>) -> String {
    let mut pairs: Vec<(&String, &Value)> = values.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let mut hasher = Sha256::new();
    for (k, v) in pairs {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.to_string().as_bytes());
        hasher.update(b"&");
    }
    hex::encode(hasher.finalize())[..8].to_string()
}

impl Strategy {
    /// Whether a matrix is configured at all. An unset strategy runs the
    /// job once with an empty combo and no `strategies` wrapper.
    pub fn is_set(&self) -> bool {
        !self.matrix.is_empty() || !self.include.is_empty()
    }

    /// Expand to the ordered combo list: cross product in key insertion
    /// order, minus key-subset `exclude` matches, plus exact-deduped
    /// `include` entries. Pure and stable under equal inputs.
    pub fn expand(&self) -> Vec<Combo> {
        let mut combos: Vec<IndexMap<String, Value>> = Vec::new();

        if !self.matrix.is_empty() {
            combos.push(IndexMap::new());
            for (key, options) in &self.matrix {
                let mut next = Vec::with_capacity(combos.len() * options.len());
                for combo in &combos {
                    for option in options {
                        let mut grown = combo.clone();
                        grown.insert(key.clone(), option.clone());
                        next.push(grown);
                    }
                }
                combos = next;
            }
        }

        combos.retain(|combo| {
            !self.exclude.iter().any(|pattern| {
                !pattern.is_empty()
                    && pattern.iter().all(|(k, v)| combo.get(k) == Some(v))
            })
        });

        for extra in &self.include {
            let duplicate = combos.iter().any(|existing| {
                existing.len() == extra.len()
                    && extra.iter().all(|(k, v)| existing.get(k) == Some(v))
            });
            if !duplicate {
                combos.push(extra.clone());
            }
        }

        combos
            .into_iter()
            .map(|values| Combo { key: strategy_key(&values), values })
            .collect()
    }
}

/// Specification of one job inside a workflow.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    /// Context key; filled from the mapping key at load when absent
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub runs_on: RunsOn,
    /// Skip this job when the rendered expression evaluates to `true`
    #[serde(default, alias = "if")]
    pub condition: Option<String>,
    /// Upstream job ids this job depends on
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub trigger_rule: Rule,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub stages: Vec<Stage>,
}
