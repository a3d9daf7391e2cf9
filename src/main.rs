//! Site Editor Sync - edit script replay
//!
//! Replays a JSON-lines edit script against an editing session backed by
//! the sled store, then detaches (saving unsaved work) and reports where
//! the page was saved.
//!
//! ```text
//! site-editor-sync <script.jsonl> [record-id]
//! ```
//!
//! Each line is one operation:
//!
//! ```text
//! {"op": "update", "fields": {"tagline": "Fresh bread"}, "source": "quick"}
//! {"op": "batch_start"}
//! {"op": "batch_end", "description": "Theme change"}
//! {"op": "undo"}
//! {"op": "wait", "ms": 1500}
//! {"op": "save"}
//! ```

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use site_editor_sync::{
    EditSource, EditorConfig, EditorSession, ElementDescriptor, MemorySessionStore, SledBackend,
    UpdateMeta,
};

const USAGE: &str = "usage: site-editor-sync <script.jsonl> [record-id]";

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ScriptOp {
    Update {
        fields: Value,
        #[serde(default = "default_source")]
        source: EditSource,
        #[serde(default)]
        section: Option<String>,
    },
    Select {
        #[serde(default)]
        section: Option<String>,
        #[serde(default = "default_source")]
        source: EditSource,
    },
    Undo {
        #[serde(default = "default_source")]
        source: EditSource,
    },
    Redo {
        #[serde(default = "default_source")]
        source: EditSource,
    },
    Save,
    BatchStart,
    BatchEnd {
        #[serde(default)]
        description: Option<String>,
    },
    Pause,
    Resume,
    Wait {
        ms: u64,
    },
}

fn default_source() -> EditSource {
    EditSource::Quick
}

async fn apply(session: &EditorSession, op: ScriptOp) -> anyhow::Result<()> {
    match op {
        ScriptOp::Update {
            fields,
            source,
            section,
        } => {
            let meta = match section {
                Some(section) => UpdateMeta::new().with_section(section),
                None => UpdateMeta::new(),
            };
            let changes = session.update_data(fields, source, meta)?;
            debug!(changes = changes.len(), %source, "Update applied");
        }
        ScriptOp::Select { section, source } => {
            session.select_element(section.map(ElementDescriptor::new), source);
        }
        ScriptOp::Undo { source } => {
            if !session.undo(source) {
                warn!("Nothing to undo");
            }
        }
        ScriptOp::Redo { source } => {
            if !session.redo(source) {
                warn!("Nothing to redo");
            }
        }
        ScriptOp::Save => {
            let receipt = session.save().await?;
            info!(record_id = %receipt.record_id, created = receipt.created, "Saved");
        }
        ScriptOp::BatchStart => session.start_batch(),
        ScriptOp::BatchEnd { description } => {
            session.end_batch(description)?;
        }
        ScriptOp::Pause => session.pause(),
        ScriptOp::Resume => session.resume(),
        ScriptOp::Wait { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "site_editor_sync=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let mut args = std::env::args().skip(1);
    let Some(script_path) = args.next() else {
        bail!(USAGE);
    };
    let record = args.next();

    let config = EditorConfig::from_env().context("Invalid configuration")?;

    info!("Initializing storage at: {}", config.storage.path);
    let backend = Arc::new(
        SledBackend::open(config.storage.clone()).context("Failed to open storage")?,
    );

    let session = EditorSession::new(config, backend.clone(), Arc::new(MemorySessionStore::new()))?;
    if let Some(id) = record {
        session
            .open(&id)
            .await
            .with_context(|| format!("Failed to open record {}", id))?;
    }

    let script = tokio::fs::read_to_string(&script_path)
        .await
        .with_context(|| format!("Failed to read {}", script_path))?;

    session.attach();

    for (index, line) in script.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let op: ScriptOp = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid operation", script_path, index + 1))?;
        apply(&session, op)
            .await
            .with_context(|| format!("{}:{}: operation failed", script_path, index + 1))?;
    }

    let detached = session.detach().await;
    backend.flush().context("Failed to flush storage")?;

    let view = session.view();
    let stats = backend.stats();
    println!("status:  {}", view.status);
    match (&view.record_id, &view.access_url) {
        (Some(id), Some(url)) => {
            println!("record:  {}", id);
            println!("url:     {}", url);
        }
        (Some(id), None) => println!("record:  {} (not saved)", id),
        _ => println!("record:  (none)"),
    }
    println!("stored:  {} record(s)", stats.record_count);

    detached.context("Final save failed")?;
    Ok(())
}
