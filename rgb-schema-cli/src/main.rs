use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rgb_schema::{
    run_job, DatasetRef, DerivedField, GdalStore, Job, SchemaReconciler, TableSet, VectorStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// データセットのフィールド一覧を表示
    Fields {
        /// 入力データセット（.shp, .gpkg, .geojson, .kml）
        #[arg(value_name = "DATASET")]
        dataset: PathBuf,

        /// レイヤ名（デフォルト: 最初のレイヤ）
        #[arg(short, long)]
        layer: Option<String>,
    },

    /// フィールドを指定した順序に並べ替えて出力
    Reconcile {
        /// 入力データセット
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// 出力データセット
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        /// フィールド順（カンマ区切り）
        #[arg(long, value_delimiter = ',', conflicts_with = "order_file")]
        order: Vec<String>,

        /// フィールド順を1行1フィールドで記述したファイル
        #[arg(long, value_name = "FILE")]
        order_file: Option<PathBuf>,

        /// 入力レイヤ名
        #[arg(short, long)]
        layer: Option<String>,

        /// 指定されていないフィールドを出力しない
        #[arg(long)]
        drop_missing: bool,

        /// 既存の出力を上書き
        #[arg(long)]
        overwrite: bool,
    },

    /// 対応表などから新しいフィールドを追加して出力
    Derive {
        /// 入力データセット
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// 出力データセット
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        /// 追加するフィールドの定義（JSON）
        #[arg(long, value_name = "FILE")]
        fields: PathBuf,

        /// 対応表（JSON）のディレクトリ
        #[arg(long, value_name = "DIR")]
        tables: Option<PathBuf>,

        /// 入力レイヤ名
        #[arg(short, long)]
        layer: Option<String>,

        /// 既存の出力を上書き
        #[arg(long)]
        overwrite: bool,
    },

    /// ジョブファイルに従って複数ソースを統合
    Run {
        /// ジョブ定義（JSON）
        #[arg(value_name = "JOB")]
        job: PathBuf,

        /// 既存の出力を上書き
        #[arg(long)]
        overwrite: bool,
    },
}

/// RUST_LOG の指定、未指定または不正なら info
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn main() -> Result<()> {
    // ログの初期化（RUST_LOG で詳細度を変更）
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok()))
        .init();

    // CLI引数の解析
    let args = Args::parse();

    // 処理開始時間を記録
    let start_time = std::time::Instant::now();

    match args.command {
        Command::Fields { dataset, layer } => {
            let dataset = dataset_ref(dataset, layer);
            print_fields(&GdalStore::new(), &dataset)?;
        }
        Command::Reconcile {
            input,
            output,
            order,
            order_file,
            layer,
            drop_missing,
            overwrite,
        } => {
            let order = match order_file {
                Some(path) => read_order_file(&path)?,
                None => order,
            };
            let store = GdalStore::new().with_overwrite(overwrite);
            let input = dataset_ref(input, layer);
            let output = DatasetRef::new(output);

            info!("Reordering fields: {:?}", input.path);
            SchemaReconciler::new(&store)
                .reconcile(&input, &order, !drop_missing, &output)
                .with_context(|| format!("Failed to reorder fields of {}", input))?;
        }
        Command::Derive {
            input,
            output,
            fields,
            tables,
            layer,
            overwrite,
        } => {
            let derived = read_derived_fields(&fields)?;
            let tables = match tables {
                Some(dir) => TableSet::load_dir(&dir)
                    .with_context(|| format!("Failed to load mapping tables from {:?}", dir))?,
                None => TableSet::new(),
            };
            let store = GdalStore::new().with_overwrite(overwrite);
            let input = dataset_ref(input, layer);
            let output = DatasetRef::new(output);

            info!("Deriving {} fields: {:?}", derived.len(), input.path);
            rgb_schema::derive::derive_fields(&store, &input, &derived, &tables, &output)
                .with_context(|| format!("Failed to derive fields of {}", input))?;
        }
        Command::Run { job, overwrite } => {
            let mut job =
                Job::from_path(&job).with_context(|| format!("Failed to read job {:?}", job))?;
            job.overwrite |= overwrite;

            let store = GdalStore::new().with_overwrite(job.overwrite);
            let report = run_job(&store, &job)?;
            info!(
                "Merged {} sources into {} ({} features)",
                report.sources, report.output, report.features
            );
        }
    }

    // 処理時間を表示
    let elapsed = start_time.elapsed();
    info!("Total processing time: {:?}", elapsed);

    Ok(())
}

fn dataset_ref(path: PathBuf, layer: Option<String>) -> DatasetRef {
    DatasetRef { path, layer }
}

fn print_fields(store: &dyn VectorStore, dataset: &DatasetRef) -> Result<()> {
    let schema = store
        .list_fields(dataset)
        .with_context(|| format!("Failed to read fields of {}", dataset))?;
    let count = store.feature_count(dataset)?;

    println!("{} ({} features)", dataset, count);
    for field in &schema {
        match field.length {
            Some(length) => println!("  {}\t{}({})", field.name, field.field_type, length),
            None => println!("  {}\t{}", field.name, field.field_type),
        }
    }
    Ok(())
}

/// フィールド順ファイルの読み込み（空行と#で始まる行は無視）
fn read_order_file(path: &Path) -> Result<Vec<String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    Ok(parse_order(&content))
}

fn parse_order(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn read_derived_fields(path: &Path) -> Result<Vec<DerivedField>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Invalid field definitions in {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_from_rust_log() {
        assert_eq!(
            log_filter(Some("rgb_schema=debug".to_string())).to_string(),
            "rgb_schema=debug"
        );
        assert_eq!(log_filter(None).to_string(), "info");
    }

    #[test]
    fn test_parse_order_skips_comments_and_blanks() {
        let content = "# Places\nOBJECTID\n ADM0_ID \n\nNAME_0\n# end\n";
        assert_eq!(parse_order(content), vec!["OBJECTID", "ADM0_ID", "NAME_0"]);
    }

    #[test]
    fn test_order_from_comma_list() {
        let args = Args::try_parse_from([
            "rgb-schema",
            "reconcile",
            "in.shp",
            "out.shp",
            "--order",
            "ADM0_ID,NAME_0,ID_0",
            "--drop-missing",
        ])
        .unwrap();

        match args.command {
            Command::Reconcile {
                order,
                drop_missing,
                overwrite,
                ..
            } => {
                assert_eq!(order, vec!["ADM0_ID", "NAME_0", "ID_0"]);
                assert!(drop_missing);
                assert!(!overwrite);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_order_and_order_file_conflict() {
        let result = Args::try_parse_from([
            "rgb-schema",
            "reconcile",
            "in.shp",
            "out.shp",
            "--order",
            "ADM0_ID",
            "--order-file",
            "order.txt",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_read_derived_fields() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("fields.json");
        fs::write(
            &path,
            r#"[{"name": "ID_0", "type": "text", "length": 3, "source": {"constant": "MEX"}}]"#,
        )
        .unwrap();

        let fields = read_derived_fields(&path).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].def.name, "ID_0");
    }
}
