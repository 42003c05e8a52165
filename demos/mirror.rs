//! Example: mirror an account into the local cache
//!
//! Seeds an in-memory account, walks its tree, downloads every file through
//! the cache and uploads one back.
//!
//! Usage:
//!   cargo run --example mirror -- [CACHE_DIR]

use std::path::PathBuf;
use std::sync::Arc;

use docsfs::{
    FileSystem, FsConfig, MemoryDocumentService, OperationObserver, ProgressStatus,
    TransferOutcome,
};
use docsfs::error::Result;
use tracing_subscriber::{EnvFilter, fmt};

const USAGE: &str = "Usage: cargo run --example mirror -- [CACHE_DIR]";

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docsfs=debug"));
    fmt().with_env_filter(filter).with_target(false).init();
}

struct PrintProgress;

impl OperationObserver for PrintProgress {
    fn on_progress(&self, status: &ProgressStatus) {
        println!(
            "  {} {}/{} bytes ({:.0}%)",
            status.virtual_path,
            status.bytes_transferred,
            status.bytes_total,
            status.percent()
        );
    }

    fn on_finished(&self, status: &ProgressStatus, outcome: &TransferOutcome) {
        println!("  {} finished: {:?}", status.virtual_path, outcome);
    }
}

fn seed() -> Arc<MemoryDocumentService> {
    let service = Arc::new(MemoryDocumentService::new());
    service.add_folder("folder:1", "Reports", None);
    service.add_folder("folder:2", "2024", Some("folder:1"));
    service.add_file("file:3", "q1.csv", Some("folder:2"), b"region,total\nnorth,12\n");
    service.add_file("file:4", "q2.csv", Some("folder:2"), b"region,total\nsouth,7\n");
    service.add_file("file:5", "readme.txt", None, b"mirrored by docsfs\n");
    service.add_hosted_document("doc:6", "Roadmap", Some("folder:1"));
    service
}

/// Paths of every file below `dir`.
async fn walk(fs: &FileSystem, dir: &str) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_string()];
    while let Some(dir) = pending.pop() {
        for node in fs.read_directory(&dir).await? {
            let path = format!("{}/{}", dir.trim_end_matches('/'), node.title);
            if node.is_directory() {
                println!("[dir]  {}", path);
                pending.push(path);
            } else {
                println!("[file] {} ({} bytes)", path, node.file_info.size);
                files.push(path);
            }
        }
    }
    Ok(files)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() > 1 {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    }
    let scratch = tempfile::tempdir()?;
    let cache_root = match args.first() {
        Some(dir) => PathBuf::from(dir),
        None => scratch.path().join("GCache").join("v1"),
    };

    let fs = FileSystem::new(seed(), FsConfig::with_cache_root(cache_root));
    fs.add_operation_observer(Arc::new(PrintProgress));
    fs.initialize().await?;

    println!("Walking account...");
    let files = walk(&fs, "/").await?;

    println!("Downloading {} files...", files.len());
    let results = futures::future::join_all(files.iter().map(|p| fs.get_file(p))).await;
    for (path, result) in files.iter().zip(results) {
        match result {
            Ok(local) if local.is_hosted_document => {
                println!("{} -> placeholder {}", path, local.path.display())
            }
            Ok(local) => println!("{} -> {}", path, local.path.display()),
            Err(e) => eprintln!("Failed to fetch {}: {}", path, e),
        }
    }

    println!("Uploading a note...");
    let note = scratch.path().join("note.txt");
    std::fs::write(&note, b"written locally\n")?;
    let node = fs.resume_upload(&note, "/Reports/note.txt").await?;
    println!("Uploaded: {} ({})", node.title, node.resource_id);

    let quota = fs.get_available_space().await?;
    println!(
        "Quota: {} of {} bytes used ({:.4}%)",
        quota.used,
        quota.total,
        quota.usage_percent()
    );

    fs.shutdown().await;
    Ok(())
}
