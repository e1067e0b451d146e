//! ローカル認識エンジン（サブプロセス）
//!
//! `[interpreter] program <画像パス> <タスクID>` を起動し、
//! 標準出力に含まれる最後のJSONオブジェクトを結果として読む。

use super::{Recognizer, Task};
use meter_regress_common::{parse_engine_output, RecognitionResult};
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct LocalRecognizer {
    program: PathBuf,
    interpreter: Option<String>,
    timeout: Duration,
}

enum RunError {
    Runtime(std::io::Error),
    Spawn(std::io::Error),
    Wait(std::io::Error),
    Timeout,
}

impl LocalRecognizer {
    pub fn new(program: PathBuf, interpreter: Option<String>, timeout: Duration) -> Self {
        Self {
            program,
            interpreter,
            timeout,
        }
    }

    fn command(&self, task: &Task) -> Command {
        let mut cmd = match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&self.program);
                cmd
            }
            None => Command::new(&self.program),
        };
        cmd.arg(&task.image_path)
            .arg(&task.task_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// 子プロセスを実行し、出力をまとめて受け取る
    ///
    /// 期限切れで future が破棄されると `kill_on_drop` により子プロセスも終了する。
    async fn execute(&self, task: &Task) -> std::result::Result<Output, RunError> {
        let child = self.command(task).spawn().map_err(RunError::Spawn)?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(RunError::Wait(e)),
            Err(_) => Err(RunError::Timeout),
        }
    }

    /// ワーカースレッドごとに単一スレッドのランタイムで実行
    fn run(&self, task: &Task) -> std::result::Result<Output, RunError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(RunError::Runtime)?;
        runtime.block_on(self.execute(task))
    }
}

impl Recognizer for LocalRecognizer {
    fn recognize(&self, task: &Task) -> RecognitionResult {
        tracing::debug!("エンジン起動: {} ({})", task.file_name, task.task_id);

        let output = match self.run(task) {
            Ok(output) => output,
            Err(RunError::Timeout) => {
                tracing::error!("タイムアウト: {}", task.image_path.display());
                return RecognitionResult::failure(format!(
                    "Timeout ({} seconds)",
                    self.timeout.as_secs()
                ));
            }
            Err(RunError::Spawn(e)) | Err(RunError::Runtime(e)) => {
                tracing::error!("エンジン起動エラー: {}: {}", self.program.display(), e);
                return RecognitionResult::failure(format!("Failed to start engine: {}", e));
            }
            Err(RunError::Wait(e)) => {
                tracing::error!("エンジン待機エラー: {}: {}", task.image_path.display(), e);
                return RecognitionResult::failure(e.to_string());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code();

        if !output.status.success() {
            tracing::error!(
                "エンジン異常終了 (code {:?}): {}: {}",
                code,
                task.image_path.display(),
                stderr.trim()
            );
            let message = if stderr.trim().is_empty() {
                format!("Engine exited with code {:?}", code)
            } else {
                stderr.trim().to_string()
            };
            return RecognitionResult::failure(message);
        }

        let result = parse_engine_output(&stdout);
        if !result.is_completed() {
            tracing::error!(
                "認識失敗: {}: {}",
                task.image_path.display(),
                result.error_message()
            );
        }
        result
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "local"
    }
}
