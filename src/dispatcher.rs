//! タスクの振り分けと実行
//!
//! 画像1枚 = タスク1件。ワーカーは共有カーソルから次のタスクを取り、
//! 認識 → テーブル反映までを1枚ずつ行う。並列実行はリモートバックエンドかつ
//! ワーカー数2以上の場合のみで、それ以外は同じ処理を現在のスレッドで順番に回す。

use crate::dataset::{SharedTable, TableSink};
use crate::error::{MeterRegressError, Result};
use crate::reconciler::{reconcile, Reconciled};
use crate::recognizer::{Recognizer, Task};
use crate::report;
use crate::scanner::ImageInfo;
use indicatif::{ProgressBar, ProgressStyle};
use meter_regress_common::{RunTotals, Summary};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    pub workers: usize,
    /// 成功何件ごとに途中保存するか
    pub checkpoint_every: usize,
    pub show_progress: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            checkpoint_every: 5,
            show_progress: true,
        }
    }
}

/// 実行カウンタ（テーブルのロックとは独立）
#[derive(Debug, Default)]
pub struct RunCounters {
    processed: AtomicUsize,
    errors: AtomicUsize,
    skipped: AtomicUsize,
    data_update_errors: AtomicUsize,
    checkpoints: AtomicUsize,
}

impl RunCounters {
    /// 成功を記録し、記録後の成功件数を返す
    fn record_success(&self) -> usize {
        self.processed.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn record_data_update_error(&self) {
        self.data_update_errors.fetch_add(1, Ordering::SeqCst);
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn totals(&self) -> RunTotals {
        RunTotals {
            processed: self.processed.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            data_update_errors: self.data_update_errors.load(Ordering::SeqCst),
        }
    }
}

/// 実行結果
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub totals: RunTotals,
    pub elapsed: Duration,
    /// 途中保存に成功した回数（最終保存は含まない）
    pub checkpoints: usize,
    pub workers: usize,
    pub summary: Summary,
}

pub struct Dispatcher<'a> {
    table: &'a SharedTable,
    recognizer: Arc<dyn Recognizer>,
    sink: &'a dyn TableSink,
    options: DispatchOptions,
    counters: RunCounters,
    /// 保存の直列化（テーブルのロックとは別）
    save_lock: Mutex<()>,
    /// 今回反映した画像のエンジン計測時間（秒）
    timings: Mutex<Vec<f64>>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        table: &'a SharedTable,
        recognizer: Arc<dyn Recognizer>,
        sink: &'a dyn TableSink,
        options: DispatchOptions,
    ) -> Self {
        Self {
            table,
            recognizer,
            sink,
            options,
            counters: RunCounters::default(),
            save_lock: Mutex::new(()),
            timings: Mutex::new(Vec::new()),
        }
    }

    /// 並列実行するワーカー数（ローカルエンジンは常に1）
    pub fn effective_workers(&self) -> usize {
        if self.options.workers > 1 && self.recognizer.is_remote() {
            self.options.workers
        } else {
            1
        }
    }

    /// 対象画像からタスク化する行を決める
    ///
    /// テーブルにない画像と処理済みの行はスキップとして数える。
    fn plan(&self, images: &[ImageInfo]) -> Result<Vec<(ImageInfo, usize)>> {
        let index = self.table.read(|t| t.build_filename_index())?;
        let mut pending = Vec::with_capacity(images.len());

        for image in images {
            let Some(&row_id) = index.get(&image.file_name) else {
                tracing::warn!("データセットに存在しない画像: {}", image.file_name);
                self.counters.record_skip();
                continue;
            };

            if self.table.is_processed(row_id)? {
                tracing::debug!("処理済みのためスキップ: {}", image.file_name);
                self.counters.record_skip();
                continue;
            }

            pending.push((image.clone(), row_id));
        }

        Ok(pending)
    }

    pub fn run(self, images: &[ImageInfo]) -> Result<RunOutcome> {
        if images.is_empty() {
            return Err(MeterRegressError::NoImagesFound("処理対象の画像がありません".into()));
        }

        let started = Instant::now();
        let pending = self.plan(images)?;
        let workers = self.effective_workers();
        tracing::info!(
            "処理対象 {}枚 / スキップ {}枚 (ワーカー {})",
            pending.len(),
            self.counters.totals().skipped,
            workers
        );

        let progress = self.progress_bar(pending.len());
        let cursor = AtomicUsize::new(0);

        let drain = |worker: usize| loop {
            let next = cursor.fetch_add(1, Ordering::SeqCst);
            let Some((image, row_id)) = pending.get(next) else { break };
            self.process(&Task::new(image, *row_id, worker));
            progress.inc(1);
        };

        if workers == 1 {
            drain(0);
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|e| MeterRegressError::Config(format!("スレッドプール作成エラー: {}", e)))?;
            let drain = &drain;
            pool.scope(|scope| {
                for worker in 0..workers {
                    scope.spawn(move |_| drain(worker));
                }
            });
        }
        progress.finish_and_clear();

        let elapsed = started.elapsed();
        let totals = self.counters.totals();
        let timings = self
            .timings
            .lock()
            .map_err(|_| MeterRegressError::LockPoisoned)?
            .clone();

        let _guard = self.save_lock.lock().map_err(|_| MeterRegressError::LockPoisoned)?;
        let snapshot = self.table.snapshot()?;
        let summary = report::summarize(&snapshot, totals, elapsed, &timings);

        self.sink
            .save_final(&snapshot, &summary)
            .map_err(|e| MeterRegressError::Persistence(e.to_string()))?;

        Ok(RunOutcome {
            totals,
            elapsed,
            checkpoints: self.counters.checkpoints.load(Ordering::SeqCst),
            workers,
            summary,
        })
    }

    /// 1枚分: 認識 → 反映 → 必要なら途中保存
    fn process(&self, task: &Task) {
        let result = self.recognizer.recognize(task);

        match reconcile(self.table, task.row_id, &result) {
            Reconciled::Success => {
                if let Some(total) = result.timing.get("total").filter(|t| t.is_finite()) {
                    if let Ok(mut timings) = self.timings.lock() {
                        timings.push(*total);
                    }
                }
                let processed = self.counters.record_success();
                tracing::debug!("完了: {}", task.file_name);
                if self.options.checkpoint_every > 0 && processed % self.options.checkpoint_every == 0 {
                    self.checkpoint(processed);
                }
            }
            Reconciled::RecognitionFailed => {
                self.counters.record_error();
                tracing::warn!("認識エラー: {}: {}", task.file_name, result.error_message());
            }
            Reconciled::DataUpdateError => self.counters.record_data_update_error(),
        }
    }

    /// 途中保存（失敗しても実行は継続）
    ///
    /// スナップショット取得から書き込みまでを保存ロック内で行うため、
    /// 古いスナップショットが新しい保存を上書きすることはない。
    fn checkpoint(&self, processed: usize) {
        let saved = self
            .save_lock
            .lock()
            .map_err(|_| MeterRegressError::LockPoisoned)
            .and_then(|_guard| {
                let snapshot = self.table.snapshot()?;
                self.sink.save(&snapshot)
            });

        match saved {
            Ok(()) => {
                self.counters.checkpoints.fetch_add(1, Ordering::SeqCst);
                tracing::info!("途中保存しました ({}枚完了)", processed);
            }
            Err(e) => tracing::warn!("途中保存に失敗しました: {}", e),
        }
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar
    }
}
