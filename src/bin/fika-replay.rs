use clap::Parser;
use fika_reconcile::store::{block_inlines, document_blocks, inline_marks};
use fika_reconcile::{
    Block, BlockKind, Doc, ExternalId, IdStrategy, Mark, MarkKind, MemoryStore, ReconcileReport,
    ReplicaConfig, Session, SessionConfig, SessionError, Step, StoreError, Transaction,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::Level;

/// Replays a JSON edit script through a session and prints the resulting rows.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Edit script to replay
    script: PathBuf,
    /// Session configuration as JSON
    #[arg(long)]
    config: Option<PathBuf>,
    /// Route edits through a replica
    #[arg(long)]
    replicated: bool,
    /// Log more to stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, thiserror::Error)]
enum ReplayError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("edit {index} failed: {source}")]
    Edit { index: usize, source: SessionError },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("cannot read rows: {0}")]
    Store(#[from] StoreError),
    #[error("cannot encode output: {0}")]
    Output(serde_json::Error),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Script {
    #[serde(default)]
    document_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    blocks: Vec<ScriptBlock>,
    #[serde(default)]
    edits: Vec<ScriptEdit>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ScriptBlock {
    #[serde(default = "paragraph")]
    kind: BlockKind,
    #[serde(default)]
    text: String,
}

fn paragraph() -> BlockKind {
    BlockKind::Paragraph
}

/// One scripted edit. Each becomes a single transaction, except `type`,
/// which feeds keys one at a time through the input rules.
#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ScriptEdit {
    InsertText {
        pos: usize,
        text: String,
    },
    Delete {
        from: usize,
        to: usize,
    },
    SplitBlock {
        pos: usize,
    },
    JoinBackward {
        pos: usize,
    },
    InsertBlock {
        index: usize,
        #[serde(default = "paragraph")]
        kind: BlockKind,
        #[serde(default)]
        text: String,
    },
    RemoveBlock {
        index: usize,
    },
    AddMark {
        from: usize,
        to: usize,
        mark: Mark,
    },
    RemoveMark {
        from: usize,
        to: usize,
        kind: MarkKind,
    },
    SetBlockKind {
        pos: usize,
        kind: BlockKind,
    },
    Type {
        caret: usize,
        text: String,
    },
    Steps {
        steps: Vec<Step>,
    },
}

#[derive(Serialize)]
struct Output {
    document_id: String,
    title: Option<String>,
    blocks: Vec<BlockOutput>,
    reports: Vec<ReconcileReport>,
}

#[derive(Serialize)]
struct BlockOutput {
    id: ExternalId,
    kind: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    attrs: BTreeMap<String, String>,
    text: String,
    order: u64,
    inlines: Vec<InlineOutput>,
}

#[derive(Serialize)]
struct InlineOutput {
    id: ExternalId,
    content: String,
    order: u64,
    marks: Vec<MarkOutput>,
}

#[derive(Serialize)]
struct MarkOutput {
    id: ExternalId,
    kind: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    attrs: BTreeMap<String, String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    match run(&cli) {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ReplayError> {
    let text = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ReplayError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn run(cli: &Cli) -> Result<String, ReplayError> {
    let script: Script = read_json(&cli.script)?;
    let mut config: SessionConfig = match &cli.config {
        Some(path) => read_json(path)?,
        None => SessionConfig::default(),
    };
    if let Some(document_id) = script.document_id {
        config.document_id = document_id;
    }
    if let Some(title) = script.title {
        config.title = title;
    }

    let doc = Doc::new(
        script
            .blocks
            .iter()
            .map(|block| Block::with_text(block.kind.clone(), &block.text)),
    );
    let mut session = Session::create(MemoryStore::new(IdStrategy::Sequential), config, doc)?;
    if cli.replicated {
        session = session.replicated(ReplicaConfig::default())?;
    }

    let mut reports = Vec::new();
    for (index, edit) in script.edits.into_iter().enumerate() {
        let mut applied = apply(&mut session, edit).map_err(|source| ReplayError::Edit { index, source })?;
        reports.append(&mut applied);
    }

    let output = Output {
        document_id: session.config().document_id.clone(),
        title: session.title()?,
        blocks: project(session.store(), &session.config().document_id)?,
        reports,
    };
    serde_json::to_string_pretty(&output).map_err(ReplayError::Output)
}

fn apply(
    session: &mut Session<MemoryStore>,
    edit: ScriptEdit,
) -> Result<Vec<ReconcileReport>, SessionError> {
    let mut tx = Transaction::new(session.doc());
    match edit {
        ScriptEdit::InsertText { pos, text } => tx.insert_text(pos, &text).map(drop)?,
        ScriptEdit::Delete { from, to } => tx.delete(from, to).map(drop)?,
        ScriptEdit::SplitBlock { pos } => tx.split_block(pos).map(drop)?,
        ScriptEdit::JoinBackward { pos } => tx.join_backward(pos).map(drop)?,
        ScriptEdit::InsertBlock { index, kind, text } => {
            tx.insert_block(index, kind, &text).map(drop)?
        }
        ScriptEdit::RemoveBlock { index } => tx.remove_block(index).map(drop)?,
        ScriptEdit::AddMark { from, to, mark } => tx.add_mark(from, to, mark).map(drop)?,
        ScriptEdit::RemoveMark { from, to, kind } => tx.remove_mark(from, to, kind).map(drop)?,
        ScriptEdit::SetBlockKind { pos, kind } => tx.set_block_kind(pos, kind).map(drop)?,
        ScriptEdit::Steps { steps } => {
            for step in steps {
                tx.step(step)?;
            }
        }
        ScriptEdit::Type { mut caret, text } => {
            let mut reports = Vec::new();
            for key in text.chars() {
                let size = session.doc().size();
                reports.push(session.handle_key(caret, key)?);
                // A triggered shortcut removes its prefix, so follow the size.
                caret = (caret + session.doc().size()).saturating_sub(size);
            }
            return Ok(reports);
        }
    }
    session.apply_local(tx).map(|report| vec![report])
}

fn project(store: &MemoryStore, document_id: &str) -> Result<Vec<BlockOutput>, StoreError> {
    let mut blocks = Vec::new();
    for (id, row) in document_blocks(store, document_id)? {
        let mut inlines = Vec::new();
        for (inline_id, inline) in block_inlines(store, &id)? {
            let marks = inline_marks(store, &inline_id)?
                .into_iter()
                .map(|(id, mark)| MarkOutput {
                    id,
                    kind: mark.kind,
                    attrs: mark.attrs,
                })
                .collect();
            inlines.push(InlineOutput {
                id: inline_id,
                content: inline.content,
                order: inline.order,
                marks,
            });
        }
        blocks.push(BlockOutput {
            id,
            kind: row.kind,
            attrs: row.attrs,
            text: row.text,
            order: row.order,
            inlines,
        });
    }
    Ok(blocks)
}
