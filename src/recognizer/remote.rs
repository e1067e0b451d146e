//! リモート認識API
//!
//! 1. `POST {base}/tasks` に画像をmultipartで送信し、タスクIDを受け取る
//! 2. サーバー提示の待ち時間（なければ既定値）だけ待つ
//! 3. `GET {base}/result?uuid={id}` を `completed` になるまでポーリング
//!
//! 結果がまだ用意できていない応答（404 / 202）は1回だけ間隔を置いて再試行する。
//! 送信からの総待ち時間が上限を超えたらその画像だけ失敗とする。

use super::{Recognizer, Task};
use crate::error::Result;
use meter_regress_common::RecognitionResult;
use reqwest::blocking::{multipart, Client};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::thread;
use std::time::{Duration, Instant};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct CreateTaskResponse {
    task_id: String,
    #[serde(default)]
    estimated_wait_time: Option<f64>,
}

/// ポーリング1回の判定
#[derive(Debug)]
enum PollOutcome {
    Done(RecognitionResult),
    Pending(String),
    /// 結果エンドポイントが未準備を示すHTTPステータスを返した
    NotReady(StatusCode),
}

#[derive(Debug, Clone)]
pub struct RemoteRecognizer {
    name: String,
    base_url: String,
    api_key: String,
    poll_interval: Duration,
    max_wait: Duration,
    fallback_wait: Duration,
    client: Client,
}

impl RemoteRecognizer {
    pub fn new(
        name: String,
        base_url: String,
        api_key: String,
        poll_interval: Duration,
        max_wait: Duration,
        fallback_wait: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            poll_interval,
            max_wait,
            fallback_wait,
            client,
        })
    }

    fn tasks_url(&self) -> String {
        format!("{}/tasks", self.base_url)
    }

    fn result_url(&self) -> String {
        format!("{}/result", self.base_url)
    }

    fn submit(&self, task: &Task) -> std::result::Result<CreateTaskResponse, String> {
        let form = multipart::Form::new()
            .text("task_id", task.task_id.clone())
            .file("file", &task.image_path)
            .map_err(|e| format!("Failed to read image: {}", e))?;

        let response = self
            .client
            .post(self.tasks_url())
            .bearer_auth(&self.api_key)
            .header("X-API-Key", &self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| format!("Task submission failed: {}", e))?;

        if response.status() != StatusCode::OK {
            return Err(format!("Task submission failed: HTTP {}", response.status()));
        }

        response
            .json::<CreateTaskResponse>()
            .map_err(|e| format!("Invalid task response: {}", e))
    }

    fn poll_once(&self, remote_id: &str) -> std::result::Result<PollOutcome, String> {
        let response = self
            .client
            .get(self.result_url())
            .query(&[("uuid", remote_id)])
            .bearer_auth(&self.api_key)
            .header("X-API-Key", &self.api_key)
            .send()
            .map_err(|e| format!("Result request failed: {}", e))?;

        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::ACCEPTED) {
            return Ok(PollOutcome::NotReady(response.status()));
        }
        if response.status() != StatusCode::OK {
            return Err(format!("Result request failed: HTTP {}", response.status()));
        }

        let value: Value = response
            .json()
            .map_err(|e| format!("Invalid result response: {}", e))?;
        Ok(classify(&value))
    }
}

/// サーバー提示の待ち時間を上限で丸める（不正値・未指定は既定値）
fn initial_wait(estimated: Option<f64>, fallback: Duration, max_wait: Duration) -> Duration {
    estimated
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(fallback)
        .min(max_wait)
}

fn classify(value: &Value) -> PollOutcome {
    match value.get("status").and_then(Value::as_str) {
        Some("completed") | Some("failed") => {
            PollOutcome::Done(RecognitionResult::from_engine_value(value))
        }
        Some(other) => PollOutcome::Pending(other.to_string()),
        None => PollOutcome::Pending(String::new()),
    }
}

impl Recognizer for RemoteRecognizer {
    fn recognize(&self, task: &Task) -> RecognitionResult {
        let started = Instant::now();
        let deadline = started + self.max_wait;

        let created = match self.submit(task) {
            Ok(created) => created,
            Err(message) => {
                tracing::error!("{}: {}", task.file_name, message);
                return RecognitionResult::failure(message);
            }
        };
        tracing::debug!(
            "タスク作成: {} → {} (推定待ち {:?}秒)",
            task.file_name,
            created.task_id,
            created.estimated_wait_time
        );

        thread::sleep(initial_wait(
            created.estimated_wait_time,
            self.fallback_wait,
            self.max_wait,
        ));

        let mut retried_not_ready = false;
        loop {
            match self.poll_once(&created.task_id) {
                Ok(PollOutcome::Done(result)) => {
                    if !result.is_completed() {
                        tracing::error!("認識失敗: {}: {}", task.file_name, result.error_message());
                    }
                    return result;
                }
                Ok(PollOutcome::Pending(status)) => {
                    tracing::trace!("{}: 待機中 ({})", created.task_id, status);
                }
                Ok(PollOutcome::NotReady(status)) if !retried_not_ready => {
                    tracing::warn!("{}: 結果未準備 (HTTP {})、再試行します", created.task_id, status);
                    retried_not_ready = true;
                }
                Ok(PollOutcome::NotReady(status)) => {
                    let message = format!("Result request failed: HTTP {}", status);
                    tracing::error!("{}: {}", task.file_name, message);
                    return RecognitionResult::failure(message);
                }
                Err(message) => {
                    tracing::error!("{}: {}", task.file_name, message);
                    return RecognitionResult::failure(message);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let message = format!("Timeout ({} seconds)", self.max_wait.as_secs());
                tracing::error!("{}: {}", task.file_name, message);
                return RecognitionResult::failure(message);
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}
