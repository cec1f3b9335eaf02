// Call stages
//
// Looks up a callable by its `group/name@tag` reference and invokes it with
// rendered kwargs. The returned mapping becomes the stage outputs.

use serde_json::{Map, Value};

use cadence_core::ErrorRecord;

use crate::outcome::StageOutcome;
use crate::runtime::ExecScope;

pub async fn run_call(
    scope: &ExecScope,
    iden: &str,
    uses: &str,
    args: Map<String, Value>,
) -> StageOutcome {
    let caller = match scope.runtime.callers.get(uses) {
        Ok(caller) => caller,
        Err(err) => return StageOutcome::fail(err.into_record(iden)),
    };
    match caller.call(args).await {
        Ok(outputs) => StageOutcome::Success(outputs),
        Err(err) => StageOutcome::fail(ErrorRecord::stage(
            iden,
            format!("caller {uses} failed: {err}"),
        )),
    }
}
