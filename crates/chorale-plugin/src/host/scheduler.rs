//! Scheduler service bindings: guest-facing timer management.
//!
//! Host functions run on the sandbox call thread, outside the runtime, so
//! the stored handle re-enters the runtime context before the timer
//! service spawns anything.

use std::sync::Arc;
use std::time::Duration;

use extism::convert::Json;
use extism::{host_fn, Function, UserData, PTR};
use serde::{Deserialize, Serialize};

use crate::runtime::HostLibrary;
use crate::scheduler::TimerService;

use super::HostContext;

#[derive(Clone)]
pub struct SchedulerHost {
    plugin: String,
    timers: Arc<TimerService>,
    handle: tokio::runtime::Handle,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    #[serde(default)]
    pub timer_id: Option<String>,
    pub delay_secs: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    pub timer_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub timer_id: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub ok: bool,
}

host_fn!(scheduler_one_time(user_data: SchedulerHost; req: Json<ScheduleRequest>) -> Json<ScheduleResponse> {
    let host = user_data.get()?;
    let host = host.lock().map_err(|_| extism::Error::msg("scheduler state poisoned"))?;
    let req = req.0;
    let _guard = host.handle.enter();
    let timer_id = host.timers.schedule_one_time(
        &host.plugin,
        req.timer_id,
        Duration::from_secs(req.delay_secs),
        req.payload,
    )?;
    Ok(Json(ScheduleResponse { timer_id }))
});

host_fn!(scheduler_recurring(user_data: SchedulerHost; req: Json<ScheduleRequest>) -> Json<ScheduleResponse> {
    let host = user_data.get()?;
    let host = host.lock().map_err(|_| extism::Error::msg("scheduler state poisoned"))?;
    let req = req.0;
    let _guard = host.handle.enter();
    let timer_id = host.timers.schedule_recurring(
        &host.plugin,
        req.timer_id,
        Duration::from_secs(req.delay_secs),
        req.payload,
    )?;
    Ok(Json(ScheduleResponse { timer_id }))
});

host_fn!(scheduler_cancel(user_data: SchedulerHost; req: Json<CancelRequest>) -> Json<CancelResponse> {
    let host = user_data.get()?;
    let host = host.lock().map_err(|_| extism::Error::msg("scheduler state poisoned"))?;
    let ok = host.timers.cancel(&req.0.timer_id);
    Ok(Json(CancelResponse { ok }))
});

pub fn library(ctx: &HostContext) -> HostLibrary {
    let state = SchedulerHost {
        plugin: ctx.owner(),
        timers: Arc::clone(&ctx.timers),
        handle: ctx.handle.clone(),
    };
    HostLibrary::new(
        "scheduler",
        vec![
            "scheduler_one_time".to_string(),
            "scheduler_recurring".to_string(),
            "scheduler_cancel".to_string(),
        ],
        move || {
            vec![
                Function::new(
                    "scheduler_one_time",
                    [PTR],
                    [PTR],
                    UserData::new(state.clone()),
                    scheduler_one_time,
                ),
                Function::new(
                    "scheduler_recurring",
                    [PTR],
                    [PTR],
                    UserData::new(state.clone()),
                    scheduler_recurring,
                ),
                Function::new(
                    "scheduler_cancel",
                    [PTR],
                    [PTR],
                    UserData::new(state.clone()),
                    scheduler_cancel,
                ),
            ]
        },
    )
}
