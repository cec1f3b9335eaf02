// Stage specifications
//
// A stage is a tagged variant discriminated by the presence of its defining
// field: echo / bash / run (VirtualScript when deps is present) / uses /
// trigger / parallel / foreach / case / until / raise / image. Deserialization
// inspects the mapping's keys explicitly instead of relying on untagged
// probing, so a typo surfaces as an unknown-field error rather than a
// mis-classified stage.

use indexmap::IndexMap;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;

/// Common stage configuration shared by every variant.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageCommon {
    /// Display name; used as the context key when no id is set
    pub name: Option<String>,
    /// Explicit context key
    pub id: Option<String>,
    pub desc: Option<String>,
    /// Skip this stage when the rendered expression evaluates to `true`
    pub condition: Option<String>,
    /// Seconds to wait before dispatch (cancellable)
    pub sleep: f64,
    /// Additional attempts after a failure
    pub retry: u32,
}

/// A single stage of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub common: StageCommon,
    pub action: StageAction,
}

/// One arm of the `case` stage.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CaseMatch {
    /// String form to compare against; `_` is the default fallback
    pub case: String,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

/// The variant-specific configuration of a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageAction {
    /// Writes `echo` to the trace; produces no outputs
    Empty { echo: Option<String> },
    /// Runs a shell script from a temporary file
    Bash {
        bash: String,
        env: IndexMap<String, String>,
    },
    /// Runs `run` in the embedded sandbox, seeded with `vars`
    Script {
        run: String,
        vars: IndexMap<String, Value>,
    },
    /// Like Script, in an isolated environment pinned by version/deps
    VirtualScript {
        run: String,
        vars: IndexMap<String, Value>,
        version: Option<String>,
        deps: Vec<String>,
    },
    /// Invokes a registered callable `group/name@tag` with kwargs
    Call {
        uses: String,
        args: IndexMap<String, Value>,
    },
    /// Releases another workflow as a child run
    Trigger {
        trigger: String,
        params: IndexMap<String, Value>,
    },
    /// Concurrent named branches of inner stages
    Parallel {
        parallel: IndexMap<String, Vec<Stage>>,
        max_workers: usize,
    },
    /// Inner stages once per item of a rendered sequence
    ForEach {
        foreach: Value,
        stages: Vec<Stage>,
        concurrent: usize,
        use_index_as_key: bool,
    },
    /// Inner stages until the `until` expression turns true
    Until {
        item: Value,
        until: String,
        stages: Vec<Stage>,
        max_loop: u32,
    },
    /// First matching arm runs; `_` is the fallback
    Case {
        case: String,
        match_arms: Vec<CaseMatch>,
        skip_not_match: bool,
    },
    /// Always fails with the rendered message
    Raise { raise: String },
    /// Reserved container variant; parses but is not executable yet
    Docker {
        image: String,
        env: IndexMap<String, String>,
    },
}

impl StageAction {
    /// Short tag used in traces and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            StageAction::Empty { .. } => "empty",
            StageAction::Bash { .. } => "bash",
            StageAction::Script { .. } => "script",
            StageAction::VirtualScript { .. } => "virtual-script",
            StageAction::Call { .. } => "call",
            StageAction::Trigger { .. } => "trigger",
            StageAction::Parallel { .. } => "parallel",
            StageAction::ForEach { .. } => "foreach",
            StageAction::Until { .. } => "until",
            StageAction::Case { .. } => "case",
            StageAction::Raise { .. } => "raise",
            StageAction::Docker { .. } => "docker",
        }
    }
}

impl Stage {
    /// The key this stage writes under in the job's `stages` mapping:
    /// the explicit id, else the name.
    pub fn iden(&self) -> Option<&str> {
        self.common
            .id
            .as_deref()
            .or(self.common.name.as_deref())
    }

    /// Inner stages of nested variants, for validation walks.
    pub fn inner_stages(&self) -> Vec<&Stage> {
        match &self.action {
            StageAction::Parallel { parallel, .. } => {
                parallel.values().flatten().collect()
            }
            StageAction::ForEach { stages, .. } | StageAction::Until { stages, .. } => {
                stages.iter().collect()
            }
            StageAction::Case { match_arms, .. } => {
                match_arms.iter().flat_map(|m| &m.stages).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn take<T: serde::de::DeserializeOwned, E: de::Error>(
    map: &mut IndexMap<String, Value>,
    key: &str,
) -> Result<Option<T>, E> {
    match map.shift_remove(key) {
        None => Ok(None),
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(|e| E::custom(format!("field {key:?}: {e}"))),
    }
}

fn clamp<E: de::Error>(name: &str, value: usize, lo: usize, hi: usize) -> Result<usize, E> {
    if (lo..=hi).contains(&value) {
        Ok(value)
    } else {
        Err(E::custom(format!("{name} must be between {lo} and {hi}, got {value}")))
    }
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut map = IndexMap::<String, Value>::deserialize(deserializer)?;

        let condition: Option<String> = match take::<String, D::Error>(&mut map, "condition")? {
            Some(c) => Some(c),
            None => take(&mut map, "if")?,
        };
        let common = StageCommon {
            name: take(&mut map, "name")?,
            id: take(&mut map, "id")?,
            desc: take(&mut map, "desc")?,
            condition,
            sleep: take(&mut map, "sleep")?.unwrap_or(0.0),
            retry: take(&mut map, "retry")?.unwrap_or(0),
        };

        const VARIANT_KEYS: &[&str] = &[
            "parallel", "foreach", "until", "case", "trigger", "uses", "run", "bash", "raise",
            "image", "echo",
        ];
        let present: Vec<&str> = VARIANT_KEYS
            .iter()
            .copied()
            .filter(|k| map.contains_key(*k))
            .collect();
        if present.len() > 1 {
            return Err(de::Error::custom(format!(
                "stage defines more than one variant field: {present:?}"
            )));
        }

        let action = match present.first().copied() {
            Some("parallel") => StageAction::Parallel {
                parallel: take::<IndexMap<String, Vec<Stage>>, D::Error>(&mut map, "parallel")?
                    .expect("present"),
                max_workers: clamp::<D::Error>(
                    "max_workers",
                    take(&mut map, "max_workers")?.unwrap_or(2),
                    1,
                    20,
                )?,
            },
            Some("foreach") => StageAction::ForEach {
                foreach: map.shift_remove("foreach").expect("present"),
                stages: take(&mut map, "stages")?.unwrap_or_default(),
                concurrent: clamp::<D::Error>(
                    "concurrent",
                    take(&mut map, "concurrent")?.unwrap_or(1),
                    1,
                    10,
                )?,
                use_index_as_key: take(&mut map, "use_index_as_key")?.unwrap_or(false),
            },
            Some("until") => StageAction::Until {
                item: map.shift_remove("item").unwrap_or(Value::from(0)),
                until: take::<String, D::Error>(&mut map, "until")?.expect("present"),
                stages: take(&mut map, "stages")?.unwrap_or_default(),
                max_loop: clamp::<D::Error>(
                    "max_loop",
                    take::<u32, D::Error>(&mut map, "max_loop")?.unwrap_or(10) as usize,
                    1,
                    100,
                )? as u32,
            },
            Some("case") => StageAction::Case {
                case: take::<String, D::Error>(&mut map, "case")?.expect("present"),
                match_arms: take(&mut map, "match")?.unwrap_or_default(),
                skip_not_match: take(&mut map, "skip_not_match")?.unwrap_or(false),
            },
            Some("trigger") => StageAction::Trigger {
                trigger: take::<String, D::Error>(&mut map, "trigger")?.expect("present"),
                params: take(&mut map, "params")?.unwrap_or_default(),
            },
            Some("uses") => StageAction::Call {
                uses: take::<String, D::Error>(&mut map, "uses")?.expect("present"),
                args: take(&mut map, "args")?.unwrap_or_default(),
            },
            Some("run") => {
                let run = take::<String, D::Error>(&mut map, "run")?.expect("present");
                let vars = take(&mut map, "vars")?.unwrap_or_default();
                if map.contains_key("deps") || map.contains_key("version") {
                    StageAction::VirtualScript {
                        run,
                        vars,
                        version: take(&mut map, "version")?,
                        deps: take(&mut map, "deps")?.unwrap_or_default(),
                    }
                } else {
                    StageAction::Script { run, vars }
                }
            }
            Some("bash") => StageAction::Bash {
                bash: take::<String, D::Error>(&mut map, "bash")?.expect("present"),
                env: take(&mut map, "env")?.unwrap_or_default(),
            },
            Some("raise") => StageAction::Raise {
                raise: take::<String, D::Error>(&mut map, "raise")?.expect("present"),
            },
            Some("image") => StageAction::Docker {
                image: take::<String, D::Error>(&mut map, "image")?.expect("present"),
                env: take(&mut map, "env")?.unwrap_or_default(),
            },
            Some("echo") | None => StageAction::Empty {
                echo: take(&mut map, "echo")?,
            },
            Some(other) => unreachable!("unhandled variant key {other}"),
        };

        if !map.is_empty() {
            let leftover: Vec<&String> = map.keys().collect();
            return Err(de::Error::custom(format!(
                "stage has unknown fields {leftover:?} for variant {:?}",
                action.kind()
            )));
        }

        Ok(Stage { common, action })
    }
}
