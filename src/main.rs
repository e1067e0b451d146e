use anyhow::Context;
use clap::Parser;
use meter_regress::{cli, config, history, pipeline, report};
use cli::{Cli, Commands};
use config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = Config::load().context("設定の読み込みに失敗しました")?;

    match cli.command {
        Commands::Run { images, dataset, engine, server, workers, timeout, no_rename, no_progress } => {
            println!("📏 meter-regress - 回帰テスト\n");

            if let Some(v) = images {
                config.images_dir = Some(v);
            }
            if let Some(v) = dataset {
                config.dataset_path = Some(v);
            }
            if let Some(v) = engine {
                config.engine.program = Some(v);
            }
            if let Some(v) = server {
                config.selected_server = v;
            }
            if let Some(v) = workers {
                config.workers = Some(v);
            }
            if let Some(v) = timeout {
                config.timeout_seconds = v;
            }
            if no_rename {
                config.rename_results = false;
            }

            let run = pipeline::run(&config, !no_progress)?;
            let summary = &run.outcome.summary;

            report::log_summary(summary);
            println!("\n{}", report::render(summary));
            println!("✔ バージョン: {}", run.version);
            println!("✔ 結果ファイル: {}", run.results_path.display());
            println!("\n✅ テスト完了");
        }

        Commands::Init { images, output } => {
            println!("📄 meter-regress - データセット雛形作成\n");
            config.images_dir = Some(images);

            let rows = pipeline::init_dataset(&config, &output)?;
            println!("✔ {}行のデータセットを作成: {}", rows, output.display());
        }

        Commands::History { limit, trend } => {
            let store = history::HistoryStore::new(config.history_path()?);
            let records = store.recent(limit)?;

            if records.is_empty() {
                println!("テスト履歴はありません");
            }
            for (i, record) in records.iter().enumerate() {
                println!("{}. {} - v{}", i + 1, record.timestamp, record.version);
                println!(
                    "   画像: {} | 成功: {} | エラー: {}",
                    record.total_images, record.successful_images, record.error_images
                );
                println!("   総合精度: {:.1}%", record.overall_accuracy);
                println!("   所要時間: {:.0}秒", record.duration_seconds);
            }

            if trend {
                println!("\nバージョン別精度推移:");
                for (version, t) in store.accuracy_trend(50)? {
                    println!(
                        "  v{}: {}回 平均 {:.1}% (最高 {:.1}% / 最低 {:.1}%)",
                        version, t.tests, t.avg_accuracy, t.best_accuracy, t.worst_accuracy
                    );
                }
            }
        }

        Commands::Config { set_images, set_dataset, set_engine, set_server, show } => {
            let changed = set_images.is_some()
                || set_dataset.is_some()
                || set_engine.is_some()
                || set_server.is_some();

            if changed {
                // 環境変数の値を書き込まないよう、ファイルの内容だけに反映する
                let mut stored = Config::load_from(&Config::config_path()?)?;
                if let Some(v) = set_images {
                    stored.images_dir = Some(v);
                }
                if let Some(v) = set_dataset {
                    stored.dataset_path = Some(v);
                }
                if let Some(v) = set_engine {
                    stored.engine.program = Some(v);
                }
                if let Some(v) = set_server {
                    stored.selected_server = v;
                }
                stored.save()?;
                println!("✔ 設定を保存しました");

                config = Config::load()?;
            }

            if !show {
                if !changed {
                    println!("--show で現在の設定を表示します");
                }
            } else {
                let path = Config::config_path()?;
                println!("設定ファイル: {}", path.display());
                println!("  画像フォルダ: {}", display_opt(config.images_dir.as_deref()));
                println!("  データセット: {}", display_opt(config.dataset_path.as_deref()));
                println!("  シート: {}", config.sheet_name);
                println!("  エンジン: {}", display_opt(config.engine.program.as_deref()));
                println!("  サーバー: {}", config.selected_server);
                for (name, server) in &config.servers {
                    println!(
                        "    {}: {} (APIキー: {})",
                        name,
                        server.base_url,
                        if server.api_key.is_some() { "設定済み" } else { "未設定" }
                    );
                }
                println!("  並列数: {}", config.worker_count());
                println!("  タイムアウト: {}秒", config.timeout_seconds);
                println!("  結果リネーム: {}", if config.rename_results { "有効" } else { "無効" });
            }
        }
    }

    Ok(())
}

fn display_opt(path: Option<&std::path::Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "未設定".to_string())
}
