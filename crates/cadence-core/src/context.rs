// Context tree
//
// The nested mapping carrying params and accumulated job/stage outputs. The
// top level during execution is {params, jobs, status?, errors?}. Each job
// writes exactly once into its slot; the setter enforces that.

use serde_json::{json, Map, Value};

use crate::error::{CoreError, ErrorRecord, Result};
use crate::status::Status;
use crate::template::Path;

/// Execution context for one release.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    root: Value,
}

impl Context {
    /// Fresh context with resolved params and no job output yet.
    pub fn new(params: Value) -> Self {
        Self {
            root: json!({"params": params, "jobs": {}}),
        }
    }

    /// Rehydrate a context from a prior release (rerun path).
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(CoreError::workflow("context root must be a mapping"));
        }
        let mut ctx = Self { root: value };
        let map = ctx.root_mut();
        map.entry("params").or_insert_with(|| json!({}));
        map.entry("jobs").or_insert_with(|| json!({}));
        Ok(ctx)
    }

    fn root_mut(&mut self) -> &mut Map<String, Value> {
        self.root.as_object_mut().expect("context root is an object")
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    pub fn params(&self) -> &Value {
        &self.root["params"]
    }

    pub fn jobs(&self) -> &Map<String, Value> {
        self.root["jobs"].as_object().expect("jobs is an object")
    }

    /// The recorded context of one job, if it has completed.
    pub fn job(&self, job_id: &str) -> Option<&Value> {
        self.jobs().get(job_id)
    }

    /// Terminal status a job recorded in its slot, if any.
    pub fn job_status(&self, job_id: &str) -> Option<Status> {
        let st = self.job(job_id)?.get("status")?;
        serde_json::from_value(st.clone()).ok()
    }

    /// Write a job's context slot. A second write to the same slot is a
    /// Workflow error: slots are single-writer.
    pub fn set_job(&mut self, job_id: &str, job_context: Value) -> Result<()> {
        let jobs = self.root_mut()["jobs"]
            .as_object_mut()
            .expect("jobs is an object");
        if jobs.contains_key(job_id) {
            return Err(CoreError::workflow(format!(
                "job slot {job_id:?} was already written"
            )));
        }
        jobs.insert(job_id.to_string(), job_context);
        Ok(())
    }

    /// Record the aggregate status of the release.
    pub fn set_status(&mut self, status: Status) {
        self.root_mut()
            .insert("status".to_string(), serde_json::to_value(status).expect("status"));
    }

    pub fn status(&self) -> Option<Status> {
        serde_json::from_value(self.root.get("status")?.clone()).ok()
    }

    /// Append an error record; the errors slot appears on first push.
    pub fn push_error(&mut self, record: ErrorRecord) {
        let errors = self
            .root_mut()
            .entry("errors")
            .or_insert_with(|| json!([]));
        errors
            .as_array_mut()
            .expect("errors is an array")
            .push(serde_json::to_value(record).expect("error record"));
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.root
            .get("errors")
            .and_then(|v| v.as_array())
            .map(|seq| {
                seq.iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolve a parsed path against the tree.
    pub fn get(&self, path: &Path) -> Option<&Value> {
        path.lookup(&self.root)
    }
}

/// Build the `{matrix?, stages, status}` context one strategy pass records.
pub fn strategy_context(matrix: Option<&Value>, stages: Value, status: Status) -> Value {
    let mut map = Map::new();
    if let Some(m) = matrix {
        if m.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
            map.insert("matrix".to_string(), m.clone());
        }
    }
    map.insert("stages".to_string(), stages);
    map.insert("status".to_string(), serde_json::to_value(status).expect("status"));
    Value::Object(map)
}

/// Build the `{outputs, status}` slot a single stage records.
pub fn stage_slot(outputs: Value, status: Status) -> Value {
    json!({"outputs": outputs, "status": status})
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_context_shape() {
        let ctx = Context::new(json!({"name": "x"}));
        assert_eq!(ctx.params(), &json!({"name": "x"}));
        assert!(ctx.jobs().is_empty());
        assert!(ctx.status().is_none());
    }

    #[test]
    fn job_slots_are_single_writer() {
        let mut ctx = Context::new(json!({}));
        ctx.set_job("a", json!({"status": "SUCCESS"})).unwrap();
        assert!(ctx.set_job("a", json!({"status": "FAILED"})).is_err());
        assert_eq!(ctx.job_status("a"), Some(Status::Success));
    }

    #[test]
    fn errors_slot_appears_on_first_push() {
        let mut ctx = Context::new(json!({}));
        assert!(ctx.as_value().get("errors").is_none());
        ctx.push_error(ErrorRecord::stage("s", "boom"));
        assert_eq!(ctx.errors().len(), 1);
    }

    #[test]
    fn rehydrate_fills_missing_slots() {
        let ctx = Context::from_value(json!({"params": {"a": 1}})).unwrap();
        assert!(ctx.jobs().is_empty());
        assert!(Context::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn path_lookup_reads_job_outputs() {
        let mut ctx = Context::new(json!({}));
        ctx.set_job("j", json!({"stages": {"s": {"outputs": {"n": 5}}}}))
            .unwrap();
        let path = Path::parse("jobs.j.stages.s.outputs.n").unwrap();
        assert_eq!(ctx.get(&path), Some(&json!(5)));
    }

    #[test]
    fn strategy_context_omits_empty_matrix() {
        let v = strategy_context(Some(&json!({})), json!({}), Status::Success);
        assert!(v.get("matrix").is_none());
        let v = strategy_context(Some(&json!({"t": "a"})), json!({}), Status::Failed);
        assert_eq!(v["matrix"], json!({"t": "a"}));
        assert_eq!(v["status"], json!("FAILED"));
    }
}
