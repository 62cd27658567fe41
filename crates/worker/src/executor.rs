use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use flowjob_core::param::SplitJobParam;
use flowjob_core::{SchedError, SchedResult};

/// 一次 Task 执行的上下文
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: i64,
    pub instance_id: i64,
    pub task_no: Option<i32>,
    pub task_param: String,
    pub execute_timeout_ms: i64,
}

/// 执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Option<String>,
    pub error_message: Option<String>,
}

impl ExecutionResult {
    pub fn success(output: Option<String>) -> Self {
        Self {
            success: true,
            output,
            error_message: None,
        }
    }

    pub fn failure<S: Into<String>>(message: S) -> Self {
        Self {
            success: false,
            output: None,
            error_message: Some(message.into()),
        }
    }
}

/// 用户任务执行器
///
/// `split` 把 job_param 拆成若干 Task 参数（默认不拆分），
/// `execute` 在执行线程池里跑单个 Task。
#[async_trait]
pub trait JobExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// 校验任务配置是否可被本执行器接受
    async fn verify(&self, param: &SplitJobParam) -> SchedResult<()> {
        let _ = param;
        Ok(())
    }

    async fn split(&self, param: &SplitJobParam) -> SchedResult<Vec<String>> {
        Ok(vec![param.job_param.clone()])
    }

    async fn execute(&self, context: &ExecutionContext) -> SchedResult<ExecutionResult>;
}

/// 注册表：executor 名称 → 实现
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// 内置 noop 与 command 执行器
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NoopExecutor));
        registry.register(Arc::new(CommandExecutor));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn JobExecutor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    pub fn resolve(&self, name: &str) -> SchedResult<Arc<dyn JobExecutor>> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| SchedError::Configuration(format!("未注册的执行器: {name}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// 空执行器，联调与测试用
pub struct NoopExecutor;

#[async_trait]
impl JobExecutor for NoopExecutor {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn execute(&self, context: &ExecutionContext) -> SchedResult<ExecutionResult> {
        debug!("noop执行: task={}", context.task_id);
        Ok(ExecutionResult::success(None))
    }
}

/// 命令执行器参数，task_param 为 JSON：{"cmd":"sh","args":["-c","..."]}
#[derive(Debug, Deserialize)]
struct CommandParam {
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
}

/// Shell 命令执行器
pub struct CommandExecutor;

#[async_trait]
impl JobExecutor for CommandExecutor {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn verify(&self, param: &SplitJobParam) -> SchedResult<()> {
        serde_json::from_str::<CommandParam>(&param.job_param)
            .map_err(|e| SchedError::Configuration(format!("命令参数无效: {e}")))?;
        Ok(())
    }

    async fn execute(&self, context: &ExecutionContext) -> SchedResult<ExecutionResult> {
        let command: CommandParam = serde_json::from_str(&context.task_param)
            .map_err(|e| SchedError::Configuration(format!("命令参数无效: {e}")))?;

        let output = tokio::process::Command::new(&command.cmd)
            .args(&command.args)
            .output()
            .await
            .map_err(|e| SchedError::internal(format!("命令启动失败: {e}")))?;

        if output.status.success() {
            Ok(ExecutionResult::success(Some(
                String::from_utf8_lossy(&output.stdout).into_owned(),
            )))
        } else {
            Ok(ExecutionResult::failure(format!(
                "命令退出码 {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowjob_core::JobType;

    fn split_param(executor: &str, job_param: &str) -> SplitJobParam {
        SplitJobParam {
            job_type: JobType::Normal,
            executor: executor.to_string(),
            job_param: job_param.to_string(),
        }
    }

    #[tokio::test]
    async fn test_registry_resolution() {
        let registry = ExecutorRegistry::with_builtins();
        assert!(registry.contains("noop"));
        assert!(registry.contains("command"));
        assert!(registry.resolve("missing").is_err());
    }

    #[tokio::test]
    async fn test_default_split_is_single_task() {
        let executor = NoopExecutor;
        let tasks = executor.split(&split_param("noop", "payload")).await.unwrap();
        assert_eq!(tasks, vec!["payload".to_string()]);
    }

    #[tokio::test]
    async fn test_command_verify_rejects_bad_json() {
        let executor = CommandExecutor;
        assert!(executor.verify(&split_param("command", "not json")).await.is_err());
        assert!(executor
            .verify(&split_param("command", r#"{"cmd":"echo","args":["hi"]}"#))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_command_executes() {
        let executor = CommandExecutor;
        let context = ExecutionContext {
            task_id: 1,
            instance_id: 1,
            task_no: Some(1),
            task_param: r#"{"cmd":"echo","args":["hello"]}"#.to_string(),
            execute_timeout_ms: 0,
        };
        let result = executor.execute(&context).await.unwrap();
        assert!(result.success);
        assert!(result.output.unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_command_failure_captured() {
        let executor = CommandExecutor;
        let context = ExecutionContext {
            task_id: 1,
            instance_id: 1,
            task_no: Some(1),
            task_param: r#"{"cmd":"sh","args":["-c","exit 3"]}"#.to_string(),
            execute_timeout_ms: 0,
        };
        let result = executor.execute(&context).await.unwrap();
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("3"));
    }
}
