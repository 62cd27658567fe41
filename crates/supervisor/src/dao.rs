//! sched_* 表的数据访问
//!
//! 全部是 `PgConnection` 上的自由函数，事务边界由 manager 把控；
//! CAS 语义的更新一律返回受影响行数是否命中。

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use flowjob_core::{
    ExecuteState, RunState, RunType, SchedDepend, SchedInstance, SchedJob, SchedResult, SchedTask,
    SchedWorkflow,
};

fn state_values(states: &[RunState]) -> Vec<i32> {
    states.iter().map(|s| s.value()).collect()
}

fn execute_state_values(states: &[ExecuteState]) -> Vec<i32> {
    states.iter().map(|s| s.value()).collect()
}

// ------------------------------------------------------------------ sched_job

fn row_to_job(row: &PgRow) -> SchedResult<SchedJob> {
    Ok(SchedJob {
        job_id: row.try_get("job_id")?,
        job_group: row.try_get("job_group")?,
        job_name: row.try_get("job_name")?,
        job_type: row.try_get("job_type")?,
        job_state: row.try_get("job_state")?,
        trigger_type: row.try_get("trigger_type")?,
        trigger_value: row.try_get("trigger_value")?,
        executor: row.try_get("executor")?,
        job_param: row.try_get("job_param")?,
        route_strategy: row.try_get("route_strategy")?,
        collision_strategy: row.try_get("collision_strategy")?,
        retry_type: row.try_get("retry_type")?,
        retry_count: row.try_get("retry_count")?,
        retry_interval: row.try_get("retry_interval")?,
        execute_timeout_ms: row.try_get("execute_timeout_ms")?,
        next_trigger_time: row.try_get("next_trigger_time")?,
        last_trigger_time: row.try_get("last_trigger_time")?,
        updated_at: row.try_get("updated_at")?,
        created_at: row.try_get("created_at")?,
    })
}

const JOB_COLUMNS: &str = "job_id, job_group, job_name, job_type, job_state, trigger_type, \
     trigger_value, executor, job_param, route_strategy, collision_strategy, retry_type, \
     retry_count, retry_interval, execute_timeout_ms, next_trigger_time, last_trigger_time, \
     updated_at, created_at";

pub async fn insert_job(conn: &mut PgConnection, job: &SchedJob) -> SchedResult<()> {
    sqlx::query(
        "INSERT INTO sched_job (job_id, job_group, job_name, job_type, job_state, trigger_type, \
         trigger_value, executor, job_param, route_strategy, collision_strategy, retry_type, \
         retry_count, retry_interval, execute_timeout_ms, next_trigger_time, last_trigger_time, \
         updated_at, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)",
    )
    .bind(job.job_id)
    .bind(&job.job_group)
    .bind(&job.job_name)
    .bind(job.job_type)
    .bind(job.job_state)
    .bind(job.trigger_type)
    .bind(&job.trigger_value)
    .bind(&job.executor)
    .bind(&job.job_param)
    .bind(job.route_strategy)
    .bind(job.collision_strategy)
    .bind(job.retry_type)
    .bind(job.retry_count)
    .bind(job.retry_interval)
    .bind(job.execute_timeout_ms)
    .bind(job.next_trigger_time)
    .bind(job.last_trigger_time)
    .bind(job.updated_at)
    .bind(job.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_job(conn: &mut PgConnection, job_id: i64) -> SchedResult<Option<SchedJob>> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM sched_job WHERE job_id = $1"))
        .bind(job_id)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(row_to_job).transpose()
}

/// ENABLE 且 next_trigger_time 不超过 max 的任务，按触发时间升序
pub async fn find_triggering_jobs(
    conn: &mut PgConnection,
    max_next_trigger_time: i64,
    limit: i64,
) -> SchedResult<Vec<SchedJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM sched_job \
         WHERE job_state = 1 AND next_trigger_time IS NOT NULL AND next_trigger_time <= $1 \
         ORDER BY next_trigger_time ASC LIMIT $2"
    ))
    .bind(max_next_trigger_time)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    rows.iter().map(row_to_job).collect()
}

/// 以旧值 CAS 推进 next_trigger_time，同时记录 last_trigger_time
pub async fn update_next_trigger_time(
    conn: &mut PgConnection,
    job_id: i64,
    from: Option<i64>,
    to: Option<i64>,
    last_trigger_time: Option<i64>,
) -> SchedResult<bool> {
    let affected = sqlx::query(
        "UPDATE sched_job SET next_trigger_time = $3, last_trigger_time = $4, updated_at = now() \
         WHERE job_id = $1 AND next_trigger_time IS NOT DISTINCT FROM $2",
    )
    .bind(job_id)
    .bind(from)
    .bind(to)
    .bind(last_trigger_time)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

pub async fn update_job_state(
    conn: &mut PgConnection,
    job_id: i64,
    to_state: i32,
    from_state: i32,
) -> SchedResult<bool> {
    let affected = sqlx::query(
        "UPDATE sched_job SET job_state = $2, updated_at = now() \
         WHERE job_id = $1 AND job_state = $3",
    )
    .bind(job_id)
    .bind(to_state)
    .bind(from_state)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

pub async fn delete_job(conn: &mut PgConnection, job_id: i64) -> SchedResult<bool> {
    let affected = sqlx::query("DELETE FROM sched_job WHERE job_id = $1")
        .bind(job_id)
        .execute(conn)
        .await?
        .rows_affected();
    Ok(affected == 1)
}

// ------------------------------------------------------------------ sched_instance

fn row_to_instance(row: &PgRow) -> SchedResult<SchedInstance> {
    Ok(SchedInstance {
        instance_id: row.try_get("instance_id")?,
        rnstance_id: row.try_get("rnstance_id")?,
        pnstance_id: row.try_get("pnstance_id")?,
        wnstance_id: row.try_get("wnstance_id")?,
        job_id: row.try_get("job_id")?,
        trigger_time: row.try_get("trigger_time")?,
        run_type: row.try_get("run_type")?,
        run_state: row.try_get("run_state")?,
        run_start_time: row.try_get("run_start_time")?,
        run_end_time: row.try_get("run_end_time")?,
        retried_count: row.try_get("retried_count")?,
        attach: row.try_get("attach")?,
        version: row.try_get("version")?,
        updated_at: row.try_get("updated_at")?,
        created_at: row.try_get("created_at")?,
    })
}

const INSTANCE_COLUMNS: &str = "instance_id, rnstance_id, pnstance_id, wnstance_id, job_id, \
     trigger_time, run_type, run_state, run_start_time, run_end_time, retried_count, attach, \
     version, updated_at, created_at";

pub async fn insert_instance(conn: &mut PgConnection, instance: &SchedInstance) -> SchedResult<()> {
    sqlx::query(
        "INSERT INTO sched_instance (instance_id, rnstance_id, pnstance_id, wnstance_id, job_id, \
         trigger_time, run_type, run_state, run_start_time, run_end_time, retried_count, attach, \
         version, updated_at, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
    )
    .bind(instance.instance_id)
    .bind(instance.rnstance_id)
    .bind(instance.pnstance_id)
    .bind(instance.wnstance_id)
    .bind(instance.job_id)
    .bind(instance.trigger_time)
    .bind(instance.run_type)
    .bind(instance.run_state)
    .bind(instance.run_start_time)
    .bind(instance.run_end_time)
    .bind(instance.retried_count)
    .bind(&instance.attach)
    .bind(instance.version)
    .bind(instance.updated_at)
    .bind(instance.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_instance(
    conn: &mut PgConnection,
    instance_id: i64,
) -> SchedResult<Option<SchedInstance>> {
    let row = sqlx::query(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM sched_instance WHERE instance_id = $1"
    ))
    .bind(instance_id)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(row_to_instance).transpose()
}

pub async fn get_instance_by_trigger(
    conn: &mut PgConnection,
    job_id: i64,
    trigger_time: i64,
    run_type: RunType,
) -> SchedResult<Option<SchedInstance>> {
    let row = sqlx::query(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM sched_instance \
         WHERE job_id = $1 AND trigger_time = $2 AND run_type = $3"
    ))
    .bind(job_id)
    .bind(trigger_time)
    .bind(run_type)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(row_to_instance).transpose()
}

pub async fn get_wnstance_id(
    conn: &mut PgConnection,
    instance_id: i64,
) -> SchedResult<Option<i64>> {
    let wnstance_id: Option<Option<i64>> =
        sqlx::query_scalar("SELECT wnstance_id FROM sched_instance WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_optional(conn)
            .await?;
    Ok(wnstance_id.flatten())
}

/// 数据库行锁，实例状态机的集群级串行化入口
pub async fn lock_instance(
    conn: &mut PgConnection,
    instance_id: i64,
) -> SchedResult<Option<SchedInstance>> {
    let row = sqlx::query(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM sched_instance WHERE instance_id = $1 FOR UPDATE"
    ))
    .bind(instance_id)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(row_to_instance).transpose()
}

/// WAITING → RUNNING，记录开始时间
pub async fn start_instance(
    conn: &mut PgConnection,
    instance_id: i64,
    now: DateTime<Utc>,
) -> SchedResult<bool> {
    let affected = sqlx::query(
        "UPDATE sched_instance SET run_state = $2, run_start_time = $3, version = version + 1, \
         updated_at = $3 WHERE instance_id = $1 AND run_state = $4",
    )
    .bind(instance_id)
    .bind(RunState::Running)
    .bind(now)
    .bind(RunState::Waiting)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// 从 from_states 之一迁移到终态/暂停态
pub async fn terminate_instance(
    conn: &mut PgConnection,
    instance_id: i64,
    to_state: RunState,
    from_states: &[RunState],
    run_end_time: Option<DateTime<Utc>>,
) -> SchedResult<bool> {
    let affected = sqlx::query(
        "UPDATE sched_instance SET run_state = $2, run_end_time = $3, version = version + 1, \
         updated_at = now() WHERE instance_id = $1 AND run_state = ANY($4)",
    )
    .bind(instance_id)
    .bind(to_state)
    .bind(run_end_time)
    .bind(state_values(from_states))
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

pub async fn update_instance_state(
    conn: &mut PgConnection,
    instance_id: i64,
    to_state: RunState,
    from_state: RunState,
) -> SchedResult<bool> {
    let affected = sqlx::query(
        "UPDATE sched_instance SET run_state = $2, version = version + 1, updated_at = now() \
         WHERE instance_id = $1 AND run_state = $3",
    )
    .bind(instance_id)
    .bind(to_state)
    .bind(from_state)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// 版本号 CAS 续期，扫描器用它防并发推进
pub async fn renew_update_time(
    conn: &mut PgConnection,
    instance_id: i64,
    now: DateTime<Utc>,
    version: i32,
) -> SchedResult<bool> {
    let affected = sqlx::query(
        "UPDATE sched_instance SET updated_at = $2, version = version + 1 \
         WHERE instance_id = $1 AND version = $3",
    )
    .bind(instance_id)
    .bind(now)
    .bind(version)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// 状态停留超过 expire_before 的实例（扫描器批量拉取）
pub async fn find_expired_instances(
    conn: &mut PgConnection,
    run_state: RunState,
    expire_before: DateTime<Utc>,
    limit: i64,
) -> SchedResult<Vec<SchedInstance>> {
    let rows = sqlx::query(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM sched_instance \
         WHERE run_state = $1 AND trigger_time <= $2 AND updated_at <= $3 \
         ORDER BY updated_at ASC LIMIT $4"
    ))
    .bind(run_state)
    .bind(expire_before.timestamp_millis())
    .bind(expire_before)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    rows.iter().map(row_to_instance).collect()
}

/// 工作流的全部节点实例（不含主实例）
pub async fn find_workflow_node_instances(
    conn: &mut PgConnection,
    wnstance_id: i64,
) -> SchedResult<Vec<SchedInstance>> {
    let rows = sqlx::query(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM sched_instance \
         WHERE wnstance_id = $1 AND instance_id != $1"
    ))
    .bind(wnstance_id)
    .fetch_all(conn)
    .await?;
    rows.iter().map(row_to_instance).collect()
}

pub async fn delete_instance(conn: &mut PgConnection, instance_id: i64) -> SchedResult<bool> {
    let affected = sqlx::query("DELETE FROM sched_instance WHERE instance_id = $1")
        .bind(instance_id)
        .execute(conn)
        .await?
        .rows_affected();
    Ok(affected == 1)
}

// ------------------------------------------------------------------ sched_task

fn row_to_task(row: &PgRow) -> SchedResult<SchedTask> {
    Ok(SchedTask {
        task_id: row.try_get("task_id")?,
        instance_id: row.try_get("instance_id")?,
        task_no: row.try_get("task_no")?,
        task_count: row.try_get("task_count")?,
        task_param: row.try_get("task_param")?,
        execute_state: row.try_get("execute_state")?,
        worker: row.try_get("worker")?,
        execute_start_time: row.try_get("execute_start_time")?,
        execute_end_time: row.try_get("execute_end_time")?,
        execute_snapshot: row.try_get("execute_snapshot")?,
        dispatch_failed_count: row.try_get("dispatch_failed_count")?,
        error_msg: row.try_get("error_msg")?,
        updated_at: row.try_get("updated_at")?,
        created_at: row.try_get("created_at")?,
    })
}

const TASK_COLUMNS: &str = "task_id, instance_id, task_no, task_count, task_param, execute_state, \
     worker, execute_start_time, execute_end_time, execute_snapshot, dispatch_failed_count, \
     error_msg, updated_at, created_at";

pub async fn batch_insert_tasks(conn: &mut PgConnection, tasks: &[SchedTask]) -> SchedResult<()> {
    for task in tasks {
        sqlx::query(
            "INSERT INTO sched_task (task_id, instance_id, task_no, task_count, task_param, \
             execute_state, worker, execute_start_time, execute_end_time, execute_snapshot, \
             dispatch_failed_count, error_msg, updated_at, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)",
        )
        .bind(task.task_id)
        .bind(task.instance_id)
        .bind(task.task_no)
        .bind(task.task_count)
        .bind(&task.task_param)
        .bind(task.execute_state)
        .bind(&task.worker)
        .bind(task.execute_start_time)
        .bind(task.execute_end_time)
        .bind(&task.execute_snapshot)
        .bind(task.dispatch_failed_count)
        .bind(&task.error_msg)
        .bind(task.updated_at)
        .bind(task.created_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn get_task(conn: &mut PgConnection, task_id: i64) -> SchedResult<Option<SchedTask>> {
    let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM sched_task WHERE task_id = $1"))
        .bind(task_id)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(row_to_task).transpose()
}

pub async fn find_tasks_by_instance(
    conn: &mut PgConnection,
    instance_id: i64,
) -> SchedResult<Vec<SchedTask>> {
    let rows = sqlx::query(&format!(
        "SELECT {TASK_COLUMNS} FROM sched_task WHERE instance_id = $1 ORDER BY task_no ASC"
    ))
    .bind(instance_id)
    .fetch_all(conn)
    .await?;
    rows.iter().map(row_to_task).collect()
}

/// WAITING → EXECUTING 并落定 worker 与开始时间
pub async fn start_task(
    conn: &mut PgConnection,
    task_id: i64,
    worker: &str,
    now: DateTime<Utc>,
) -> SchedResult<bool> {
    let affected = sqlx::query(
        "UPDATE sched_task SET execute_state = $2, worker = $3, execute_start_time = $4, \
         updated_at = $4 WHERE task_id = $1 AND execute_state = $5",
    )
    .bind(task_id)
    .bind(ExecuteState::Executing)
    .bind(worker)
    .bind(now)
    .bind(ExecuteState::Waiting)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// 以 from_state CAS 迁移到终态（或暂停态）
pub async fn terminate_task(
    conn: &mut PgConnection,
    task_id: i64,
    to_state: ExecuteState,
    from_state: ExecuteState,
    execute_end_time: Option<DateTime<Utc>>,
    error_msg: Option<&str>,
) -> SchedResult<bool> {
    let affected = sqlx::query(
        "UPDATE sched_task SET execute_state = $2, execute_end_time = $3, \
         error_msg = COALESCE($4, error_msg), updated_at = now() \
         WHERE task_id = $1 AND execute_state = $5",
    )
    .bind(task_id)
    .bind(to_state)
    .bind(execute_end_time)
    .bind(error_msg)
    .bind(from_state)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// 按实例批量迁移 Task 状态，返回命中行数
pub async fn update_tasks_state_by_instance(
    conn: &mut PgConnection,
    instance_id: i64,
    to_state: ExecuteState,
    from_states: &[ExecuteState],
    execute_end_time: Option<DateTime<Utc>>,
) -> SchedResult<u64> {
    let affected = sqlx::query(
        "UPDATE sched_task SET execute_state = $2, execute_end_time = COALESCE($3, execute_end_time), \
         updated_at = now() WHERE instance_id = $1 AND execute_state = ANY($4)",
    )
    .bind(instance_id)
    .bind(to_state)
    .bind(execute_end_time)
    .bind(execute_state_values(from_states))
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected)
}

/// 认领绑定，只在 Task 仍是 WAITING 时生效
pub async fn update_task_worker(
    conn: &mut PgConnection,
    task_id: i64,
    worker: Option<&str>,
) -> SchedResult<bool> {
    let affected = sqlx::query(
        "UPDATE sched_task SET worker = $2, updated_at = now() \
         WHERE task_id = $1 AND execute_state = $3",
    )
    .bind(task_id)
    .bind(worker)
    .bind(ExecuteState::Waiting)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// 保存执行检查点，仅执行中的 Task 可写
pub async fn checkpoint_task(
    conn: &mut PgConnection,
    task_id: i64,
    execute_snapshot: &str,
) -> SchedResult<bool> {
    let affected = sqlx::query(
        "UPDATE sched_task SET execute_snapshot = $2, updated_at = now() \
         WHERE task_id = $1 AND execute_state = $3",
    )
    .bind(task_id)
    .bind(execute_snapshot)
    .bind(ExecuteState::Executing)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// 累计派发失败次数，返回累计后的值
pub async fn incr_dispatch_failed(conn: &mut PgConnection, task_id: i64) -> SchedResult<i32> {
    let count: i32 = sqlx::query_scalar(
        "UPDATE sched_task SET dispatch_failed_count = dispatch_failed_count + 1, \
         updated_at = now() WHERE task_id = $1 RETURNING dispatch_failed_count",
    )
    .bind(task_id)
    .fetch_one(conn)
    .await?;
    Ok(count)
}

pub async fn delete_tasks_by_instance(
    conn: &mut PgConnection,
    instance_id: i64,
) -> SchedResult<u64> {
    let affected = sqlx::query("DELETE FROM sched_task WHERE instance_id = $1")
        .bind(instance_id)
        .execute(conn)
        .await?
        .rows_affected();
    Ok(affected)
}

// ------------------------------------------------------------------ sched_workflow

fn row_to_workflow(row: &PgRow) -> SchedResult<SchedWorkflow> {
    Ok(SchedWorkflow {
        wnstance_id: row.try_get("wnstance_id")?,
        pre_node: row.try_get("pre_node")?,
        cur_node: row.try_get("cur_node")?,
        sequence: row.try_get("sequence")?,
        run_state: row.try_get("run_state")?,
        instance_id: row.try_get("instance_id")?,
    })
}

pub async fn batch_insert_workflows(
    conn: &mut PgConnection,
    workflows: &[SchedWorkflow],
) -> SchedResult<()> {
    for workflow in workflows {
        sqlx::query(
            "INSERT INTO sched_workflow (wnstance_id, pre_node, cur_node, sequence, run_state, \
             instance_id) VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(workflow.wnstance_id)
        .bind(&workflow.pre_node)
        .bind(&workflow.cur_node)
        .bind(workflow.sequence)
        .bind(workflow.run_state)
        .bind(workflow.instance_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn find_workflows(
    conn: &mut PgConnection,
    wnstance_id: i64,
) -> SchedResult<Vec<SchedWorkflow>> {
    let rows = sqlx::query(
        "SELECT wnstance_id, pre_node, cur_node, sequence, run_state, instance_id \
         FROM sched_workflow WHERE wnstance_id = $1 ORDER BY sequence ASC",
    )
    .bind(wnstance_id)
    .fetch_all(conn)
    .await?;
    rows.iter().map(row_to_workflow).collect()
}

/// 工作流边的通用 CAS 更新
///
/// - `cur_node = None` 时作用于整个工作流；
/// - `to_instance_id = Some` 时同步回填节点实例 id；
/// - `from_instance_id = Some` 时要求边当前绑定该实例（重试换绑用）。
pub async fn update_workflow_state(
    conn: &mut PgConnection,
    wnstance_id: i64,
    cur_node: Option<&str>,
    to_state: RunState,
    to_instance_id: Option<i64>,
    from_states: &[RunState],
    from_instance_id: Option<i64>,
) -> SchedResult<u64> {
    let affected = sqlx::query(
        "UPDATE sched_workflow SET run_state = $3, \
         instance_id = COALESCE($4, instance_id) \
         WHERE wnstance_id = $1 \
           AND ($2::varchar IS NULL OR cur_node = $2) \
           AND run_state = ANY($5) \
           AND ($6::bigint IS NULL OR instance_id = $6)",
    )
    .bind(wnstance_id)
    .bind(cur_node)
    .bind(to_state)
    .bind(to_instance_id)
    .bind(state_values(from_states))
    .bind(from_instance_id)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected)
}

/// RESUME：工作流的 PAUSED 边全部回到 WAITING
pub async fn resume_workflow_waiting(
    conn: &mut PgConnection,
    wnstance_id: i64,
) -> SchedResult<u64> {
    let affected = sqlx::query(
        "UPDATE sched_workflow SET run_state = $2 WHERE wnstance_id = $1 AND run_state = $3",
    )
    .bind(wnstance_id)
    .bind(RunState::Waiting)
    .bind(RunState::Paused)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected)
}

pub async fn delete_workflows(conn: &mut PgConnection, wnstance_id: i64) -> SchedResult<u64> {
    let affected = sqlx::query("DELETE FROM sched_workflow WHERE wnstance_id = $1")
        .bind(wnstance_id)
        .execute(conn)
        .await?
        .rows_affected();
    Ok(affected)
}

// ------------------------------------------------------------------ sched_depend

pub async fn batch_insert_depends(
    conn: &mut PgConnection,
    depends: &[SchedDepend],
) -> SchedResult<()> {
    for depend in depends {
        sqlx::query(
            "INSERT INTO sched_depend (parent_job_id, child_job_id, sequence) VALUES ($1,$2,$3)",
        )
        .bind(depend.parent_job_id)
        .bind(depend.child_job_id)
        .bind(depend.sequence)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn find_depends_by_parent(
    conn: &mut PgConnection,
    parent_job_id: i64,
) -> SchedResult<Vec<SchedDepend>> {
    let rows = sqlx::query(
        "SELECT parent_job_id, child_job_id, sequence FROM sched_depend \
         WHERE parent_job_id = $1 ORDER BY sequence ASC",
    )
    .bind(parent_job_id)
    .fetch_all(conn)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(SchedDepend {
                parent_job_id: row.try_get("parent_job_id")?,
                child_job_id: row.try_get("child_job_id")?,
                sequence: row.try_get("sequence")?,
            })
        })
        .collect()
}

pub async fn delete_depends_by_child(
    conn: &mut PgConnection,
    child_job_id: i64,
) -> SchedResult<u64> {
    let affected = sqlx::query("DELETE FROM sched_depend WHERE child_job_id = $1")
        .bind(child_job_id)
        .execute(conn)
        .await?
        .rows_affected();
    Ok(affected)
}

pub async fn delete_depends_by_parent(
    conn: &mut PgConnection,
    parent_job_id: i64,
) -> SchedResult<u64> {
    let affected = sqlx::query("DELETE FROM sched_depend WHERE parent_job_id = $1")
        .bind(parent_job_id)
        .execute(conn)
        .await?
        .rows_affected();
    Ok(affected)
}
