use std::time::Instant;

use agents::{ExecutorValidator, RouteTo, SchemaSelector, SqlGenerator};
use agents::state::AgentState;
use common::error::KgAgentError;
use kg_manager::LoadedKg;
use tracing::{info, instrument, warn};

/// Hard cap on stage transitions per run, independent of `max_retries`. `max_retries`
/// bounds how many times the error router will send control backwards; this bounds the
/// loop itself, so a bug in that bookkeeping can't spin forever.
const MAX_ITERATIONS: usize = 20;

/// Drives one query end to end through schema selection, SQL generation, and execution,
/// following the error router's back-edges until it reaches `RouteTo::Complete` or the
/// retry budget (or the hard iteration cap) runs out.
pub struct QueryWorkflow<'a> {
    schema_selector: SchemaSelector<'a>,
    sql_generator: SqlGenerator<'a>,
    executor_validator: ExecutorValidator<'a>,
}

impl<'a> QueryWorkflow<'a> {
    pub fn new(
        schema_selector: SchemaSelector<'a>,
        sql_generator: SqlGenerator<'a>,
        executor_validator: ExecutorValidator<'a>,
    ) -> Self {
        Self {
            schema_selector,
            sql_generator,
            executor_validator,
        }
    }

    #[instrument(level = "trace", skip_all, fields(kg_id = %state.kg_id))]
    pub async fn run(&self, mut state: AgentState, kg: &LoadedKg) -> Result<AgentState, KgAgentError> {
        for iteration in 0..MAX_ITERATIONS {
            let stage_started = Instant::now();

            match state.route_to {
                RouteTo::SchemaSelector => {
                    self.schema_selector.run(&mut state, kg).await?;
                    state.record_timing("schema_selector", stage_started.elapsed().as_millis() as u64);
                    state.route_to = RouteTo::SqlGenerator;
                }
                RouteTo::SqlGenerator => {
                    self.sql_generator.run(&mut state).await?;
                    state.record_timing("sql_generator", stage_started.elapsed().as_millis() as u64);
                    state.route_to = RouteTo::ExecutorValidator;
                }
                RouteTo::ExecutorValidator => {
                    self.executor_validator.run(&mut state).await?;
                    state.record_timing(
                        "executor_validator",
                        stage_started.elapsed().as_millis() as u64,
                    );
                    // route_to was already set by the executor/error-router: Complete on
                    // success or exhausted retries, SchemaSelector/SqlGenerator otherwise.
                }
                RouteTo::Complete => {
                    info!(kg_id = %state.kg_id, iterations = iteration, "query workflow complete");
                    return Ok(state);
                }
            }
        }

        warn!(
            kg_id = %state.kg_id,
            iterations = MAX_ITERATIONS,
            "query workflow hit the hard iteration cap without completing; terminating run"
        );
        state.route_to = RouteTo::Complete;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agents::state::{ExecutionResult, RouteTo as RT};

    #[test]
    fn max_iterations_is_well_above_max_retries_default() {
        let state = AgentState::new("kg".into(), "q".into(), String::new(), String::new());
        assert!(MAX_ITERATIONS as u32 > state.max_retries * 2);
    }

    #[test]
    fn complete_route_is_terminal_marker() {
        let mut state = AgentState::new("kg".into(), "q".into(), String::new(), String::new());
        state.route_to = RT::Complete;
        state.execution_result = Some(ExecutionResult {
            columns: vec!["id".into()],
            rows: vec![],
            row_count: 0,
            execution_time_ms: 1,
        });
        assert_eq!(state.route_to, RouteTo::Complete);
    }
}
