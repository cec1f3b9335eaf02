// Workflow specification and load-time validation
//
// A workflow document is `<name>: {type: Workflow, params, on, jobs}`. The
// spec is immutable after load and shared read-only by every concurrent
// release. Validation runs once at load: job graph acyclicity, known needs
// targets, stage identities, strategy bounds, event rules.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::{CoreError, Result};
use crate::event::On;
use crate::job::Job;
use crate::params::ParamSpec;
use crate::stage::Stage;

/// Upper bound on a strategy's concurrent passes.
pub const MAX_STRATEGY_PARALLEL: usize = 9;

/// The body of a workflow document, before the name is attached.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDoc {
    /// Document discriminator; must be `Workflow`
    #[serde(default, rename = "type")]
    pub type_: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub params: IndexMap<String, ParamSpec>,
    #[serde(default)]
    pub on: On,
    #[serde(default)]
    pub jobs: IndexMap<String, Job>,
}

/// A validated, immutable workflow specification.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub desc: Option<String>,
    pub params: IndexMap<String, ParamSpec>,
    pub on: On,
    pub jobs: IndexMap<String, Job>,
}

impl Workflow {
    /// Attach a name to a parsed document and validate the result.
    pub fn from_doc(name: impl Into<String>, doc: WorkflowDoc, default_tz: &str) -> Result<Self> {
        let name = name.into();
        if let Some(ty) = &doc.type_ {
            if ty != "Workflow" {
                return Err(CoreError::workflow(format!(
                    "document {name:?} has type {ty:?}, expected \"Workflow\""
                )));
            }
        }
        let mut jobs = doc.jobs;
        for (key, job) in jobs.iter_mut() {
            job.id.get_or_insert_with(|| key.clone());
        }
        let wf = Self {
            name,
            desc: doc.desc,
            params: doc.params,
            on: doc.on,
            jobs,
        };
        wf.validate(default_tz)?;
        Ok(wf)
    }

    /// Parse one named workflow out of a multi-document YAML mapping.
    pub fn from_yaml(name: &str, yaml: &str, default_tz: &str) -> Result<Self> {
        let docs: IndexMap<String, WorkflowDoc> = serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::loader(format!("yaml does not parse: {e}")))?;
        let doc = docs
            .into_iter()
            .find_map(|(key, doc)| (key == name).then_some(doc))
            .ok_or_else(|| CoreError::loader(format!("workflow {name:?} not found in document")))?;
        Self::from_doc(name, doc, default_tz)
    }

    fn validate(&self, default_tz: &str) -> Result<()> {
        self.on.compile(default_tz)?;

        for (job_id, job) in &self.jobs {
            for need in &job.needs {
                if !self.jobs.contains_key(need) {
                    return Err(CoreError::workflow(format!(
                        "job {job_id:?} needs unknown job {need:?}"
                    )));
                }
            }
            if !(1..=MAX_STRATEGY_PARALLEL).contains(&job.strategy.max_parallel) {
                return Err(CoreError::workflow(format!(
                    "job {job_id:?}: strategy max_parallel must be 1..={MAX_STRATEGY_PARALLEL}"
                )));
            }
            validate_stage_list(job_id, &job.stages)?;
        }

        self.check_acyclic()?;
        Ok(())
    }

    /// Kahn's algorithm over the needs edges; leftovers mean a cycle.
    fn check_acyclic(&self) -> Result<()> {
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, job) in &self.jobs {
            indegree.entry(id).or_insert(0);
            for need in &job.needs {
                *indegree.entry(id).or_insert(0) += 1;
                downstream.entry(need).or_default().push(id);
            }
        }
        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut seen = 0;
        while let Some(id) = ready.pop() {
            seen += 1;
            for next in downstream.get(id).into_iter().flatten() {
                let deg = indegree.get_mut(next).expect("known job");
                *deg -= 1;
                if *deg == 0 {
                    ready.push(next);
                }
            }
        }
        if seen != self.jobs.len() {
            return Err(CoreError::workflow(format!(
                "workflow {:?} has a dependency cycle",
                self.name
            )));
        }
        Ok(())
    }

    /// Job ids downstream of `roots`, following needs edges transitively.
    /// Used by rerun to find everything that must re-execute.
    pub fn downstream_closure<'a>(
        &'a self,
        roots: impl IntoIterator<Item = &'a str>,
    ) -> HashSet<String> {
        let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, job) in &self.jobs {
            for need in &job.needs {
                downstream.entry(need.as_str()).or_default().push(id);
            }
        }
        let mut out: HashSet<String> = HashSet::new();
        let mut stack: Vec<&str> = roots.into_iter().collect();
        while let Some(id) = stack.pop() {
            if !out.insert(id.to_string()) {
                continue;
            }
            for next in downstream.get(id).into_iter().flatten() {
                stack.push(next);
            }
        }
        out
    }
}

/// Every stage needs an identity (id or name) and identities must be unique
/// within their list; nested stage lists are checked recursively.
fn validate_stage_list(job_id: &str, stages: &[Stage]) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for stage in stages {
        let iden = stage.iden().ok_or_else(|| {
            CoreError::workflow(format!(
                "job {job_id:?} has a {} stage without id or name",
                stage.action.kind()
            ))
        })?;
        if !seen.insert(iden) {
            return Err(CoreError::workflow(format!(
                "job {job_id:?} has duplicate stage identity {iden:?}"
            )));
        }
        let inner = stage.inner_stages();
        if !inner.is_empty() {
            validate_inner(job_id, &inner)?;
        }
    }
    Ok(())
}

fn validate_inner(job_id: &str, stages: &[&Stage]) -> Result<()> {
    for stage in stages {
        stage.iden().ok_or_else(|| {
            CoreError::workflow(format!(
                "job {job_id:?} has a nested {} stage without id or name",
                stage.action.kind()
            ))
        })?;
        let inner = stage.inner_stages();
        if !inner.is_empty() {
            validate_inner(job_id, &inner)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMO: &str = r#"
    etl-demo:
      type: Workflow
      desc: |
        Extract and load demo.
      params:
        run-date: datetime
      on:
        - cronjob: "0 2 * * *"
      jobs:
        extract:
          stages:
            - name: pull
              bash: "echo pull"
        load:
          needs: [extract]
          stages:
            - name: push
              echo: loading
    "#;

    #[test]
    fn loads_named_document() {
        let wf = Workflow::from_yaml("etl-demo", DEMO, "UTC").unwrap();
        assert_eq!(wf.name, "etl-demo");
        assert_eq!(wf.jobs.len(), 2);
        // Job ids are filled from the mapping keys
        assert_eq!(wf.jobs["load"].id.as_deref(), Some("load"));
        assert!(Workflow::from_yaml("other", DEMO, "UTC").is_err());
    }

    #[test]
    fn wrong_type_discriminator_rejected() {
        let yaml = "wf:\n  type: Pipeline\n  jobs: {}\n";
        assert!(Workflow::from_yaml("wf", yaml, "UTC").is_err());
    }

    #[test]
    fn unknown_needs_rejected() {
        let yaml = r#"
        wf:
          jobs:
            a:
              needs: [ghost]
              stages: []
        "#;
        let err = Workflow::from_yaml("wf", yaml, "UTC").unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn cycle_is_a_workflow_error() {
        let yaml = r#"
        wf:
          jobs:
            a: {needs: [b]}
            b: {needs: [a]}
        "#;
        let err = Workflow::from_yaml("wf", yaml, "UTC").unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn nameless_stage_rejected() {
        let yaml = r#"
        wf:
          jobs:
            a:
              stages:
                - bash: "true"
        "#;
        assert!(Workflow::from_yaml("wf", yaml, "UTC").is_err());
    }

    #[test]
    fn duplicate_stage_identity_rejected() {
        let yaml = r#"
        wf:
          jobs:
            a:
              stages:
                - {name: s, echo: one}
                - {name: s, echo: two}
        "#;
        assert!(Workflow::from_yaml("wf", yaml, "UTC").is_err());
    }

    #[test]
    fn strategy_parallel_bound() {
        let yaml = r#"
        wf:
          jobs:
            a:
              strategy:
                matrix: {x: [1]}
                max_parallel: 10
              stages: []
        "#;
        assert!(Workflow::from_yaml("wf", yaml, "UTC").is_err());
    }

    #[test]
    fn downstream_closure_walks_transitively() {
        let yaml = r#"
        wf:
          jobs:
            a: {}
            b: {needs: [a]}
            c: {needs: [b]}
            d: {}
        "#;
        let wf = Workflow::from_yaml("wf", yaml, "UTC").unwrap();
        let closure = wf.downstream_closure(["a"]);
        assert_eq!(closure.len(), 3);
        assert!(closure.contains("c"));
        assert!(!closure.contains("d"));
    }
}
