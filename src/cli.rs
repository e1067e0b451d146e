use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "meter-regress")]
#[command(about = "メーター認識エンジンの回帰テストハーネス", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 詳細ログを出力
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 画像フォルダを認識し、データセットと照合
    Run {
        /// 画像フォルダ（FOLDER_TEST）
        #[arg(short, long)]
        images: Option<PathBuf>,

        /// データセットExcel（EXCEL_DATA）
        #[arg(short, long)]
        dataset: Option<PathBuf>,

        /// 認識エンジンのプログラム（PROGRAM_SCRIPT）
        #[arg(short, long)]
        engine: Option<PathBuf>,

        /// 使用するサーバー名（"default" はローカル実行）
        #[arg(short, long)]
        server: Option<String>,

        /// 並列数（リモート実行時のみ有効）
        #[arg(short, long)]
        workers: Option<usize>,

        /// 1枚あたりのタイムアウト秒数（ローカル実行）
        #[arg(long)]
        timeout: Option<u64>,

        /// 結果ファイルをリネームしない
        #[arg(long)]
        no_rename: bool,

        /// 進捗バーを表示しない
        #[arg(long)]
        no_progress: bool,
    },

    /// 画像フォルダからデータセットの雛形を作成
    Init {
        /// 画像フォルダ
        #[arg(required = true)]
        images: PathBuf,

        /// 出力Excelファイル
        #[arg(short, long, default_value = "image_data.xlsx")]
        output: PathBuf,
    },

    /// テスト履歴を表示
    History {
        /// 表示件数
        #[arg(short, long, default_value = "5")]
        limit: usize,

        /// バージョン別の精度推移を表示
        #[arg(long)]
        trend: bool,
    },

    /// 設定を保存・表示
    Config {
        /// 画像フォルダを保存
        #[arg(long)]
        set_images: Option<PathBuf>,

        /// データセットExcelを保存
        #[arg(long)]
        set_dataset: Option<PathBuf>,

        /// 認識エンジンのプログラムを保存
        #[arg(long)]
        set_engine: Option<PathBuf>,

        /// 使用するサーバー名を保存
        #[arg(long)]
        set_server: Option<String>,

        /// 設定を表示
        #[arg(long)]
        show: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_overrides() {
        let cli = Cli::parse_from([
            "meter-regress", "run", "--images", "imgs", "--server", "gpu", "-w", "4", "--no-rename",
        ]);
        match cli.command {
            Commands::Run { images, server, workers, no_rename, dataset, .. } => {
                assert_eq!(images, Some(PathBuf::from("imgs")));
                assert_eq!(server.as_deref(), Some("gpu"));
                assert_eq!(workers, Some(4));
                assert!(no_rename);
                assert!(dataset.is_none());
            }
            _ => panic!("run expected"),
        }
    }

    #[test]
    fn test_parse_history_defaults() {
        let cli = Cli::parse_from(["meter-regress", "-v", "history"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::History { limit: 5, trend: false }));
    }

    #[test]
    fn test_parse_config_setters() {
        let cli = Cli::parse_from(["meter-regress", "config", "--set-server", "gpu", "--show"]);
        match cli.command {
            Commands::Config { set_server, set_images, show, .. } => {
                assert_eq!(set_server.as_deref(), Some("gpu"));
                assert!(set_images.is_none());
                assert!(show);
            }
            _ => panic!("config expected"),
        }
    }
}
