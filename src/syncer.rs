//! Orchestrates one sync session: builds and exchanges indices, runs the
//! reconciler, and executes the resulting commands either against the
//! local filesystem or over the wire.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::error::ExecuteOutcome;
use crate::index::{self, Index, IndexKind};
use crate::net::Session;
use crate::protocol::{self, Frame, OpCode, ProtocolLimits};
use crate::reconciler::{self, SyncCommand, Verb};

/// Session-wide settings threaded through every handler.
#[derive(Clone)]
pub struct Config {
    pub local_root: PathBuf,
    pub limits: ProtocolLimits,
    pub rate_hz: f64,
    pub auto_sync: bool,
    pub dry_run: bool,
    pub exit_after_sync: bool,
    pub verbose: bool,
}

/// Sends the bare request that kicks off a sync: "send me your index".
pub async fn request_index(session: &Session) -> Result<()> {
    let _tx = session.acquire_transmit().await;
    session.send_frame(&Frame::empty(OpCode::IndexFolder)).await
}

fn backup_index_file(root: &Path, current_kind: IndexKind, last_run_kind: IndexKind) -> Result<bool> {
    let current_path = root.join(current_kind.filename());
    let last_run_path = root.join(last_run_kind.filename());
    if !current_path.is_file() {
        return Ok(false);
    }
    if last_run_path.is_file() {
        fs::remove_file(&last_run_path)
            .with_context(|| format!("removing stale {}", last_run_path.display()))?;
    }
    fs::rename(&current_path, &last_run_path).with_context(|| {
        format!("backing up {} to {}", current_path.display(), last_run_path.display())
    })?;
    Ok(true)
}

/// Listener-side response to an inbound `IndexFolder` request: build this
/// side's index and ship it, along with its own last-run index (or a
/// zero-byte placeholder if there isn't one yet), to the peer.
pub async fn handle_index_folder(session: &Session, cfg: &Config) -> Result<ExecuteOutcome> {
    let had_last_run = backup_index_file(&cfg.local_root, IndexKind::Local, IndexKind::LocalLastRun)?;

    println!("starting to index {}", cfg.local_root.display());
    let last_run = if had_last_run {
        Some(Index::build(&cfg.local_root, IndexKind::LocalLastRun)?)
    } else {
        None
    };
    let mut current = Index::build(&cfg.local_root, IndexKind::Local)?;
    let deletions = current.deletions_since(last_run.as_ref().map(|idx| &idx.root));
    current.save(&cfg.local_root)?;
    if let Some(mut seed) = last_run {
        seed.save(&cfg.local_root)?;
    }

    let canonical_root = cfg.local_root.canonicalize()?;
    let header = protocol::encode_index_payload_header(&canonical_root.to_string_lossy(), &deletions)?;

    let _tx = session.acquire_transmit().await;
    session.send_frame(&header).await?;

    let current_path = cfg.local_root.join(IndexKind::Local.filename());
    session.send_file_stream(&current_path, IndexKind::Local.filename()).await?;

    let last_run_path = cfg.local_root.join(IndexKind::LocalLastRun.filename());
    if last_run_path.is_file() {
        session.send_file_stream(&last_run_path, IndexKind::LocalLastRun.filename()).await?;
    } else {
        session.send_empty_file_stream(IndexKind::LocalLastRun.filename()).await?;
    }
    Ok(ExecuteOutcome::Continue)
}

/// Initiator-side handling of an `IndexPayload` header frame. Drains the two
/// embedded index files using the receive permit the caller already
/// acquired (`rx`, held until both streams land), then reconciles and acts
/// on the result. Intended to run inside a detached task so the caller's
/// dispatch loop isn't blocked on a large transfer.
pub async fn handle_index_payload(
    session: Session,
    cfg: Config,
    header: Frame,
    rx: tokio::sync::OwnedSemaphorePermit,
) -> Result<ExecuteOutcome> {
    let (remote_root, remote_deletions) = protocol::decode_index_payload_header(&header, &cfg.limits)?;
    println!("received index for remote path: {remote_root}");

    let remote_index_path = cfg.local_root.join(IndexKind::Remote.filename());
    let remote_last_run_path = cfg.local_root.join(IndexKind::RemoteLastRun.filename());

    session.recv_file_stream(&remote_index_path).await?;
    let last_run_header = session.recv_file_stream(&remote_last_run_path).await?;
    drop(rx);

    let had_local_last_run = backup_index_file(&cfg.local_root, IndexKind::Local, IndexKind::LocalLastRun)?;

    println!("importing remote index");
    let mut remote = Index::load(&cfg.local_root, IndexKind::Remote)?;
    remote.root.name = remote_root.clone();

    // `recv_file_stream` always creates `remote_last_run_path`, even for the
    // empty placeholder the sender transmits when it has no last-run index,
    // so an empty transfer (not file existence) is what signals "none sent".
    let remote_last_run = if last_run_header.file_size > 0 {
        println!("importing remote index from last run");
        let mut idx = Index::load(&cfg.local_root, IndexKind::RemoteLastRun)?;
        idx.root.name = remote_root.clone();
        Some(idx)
    } else {
        None
    };

    let local_last_run = if had_local_last_run {
        println!("importing local index from last run");
        Some(Index::build(&cfg.local_root, IndexKind::LocalLastRun)?)
    } else {
        None
    };

    println!("remote and local indexes in hand, ready to sync");
    let mut local = Index::build(&cfg.local_root, IndexKind::Local)?;
    let local_deletions = local.deletions_since(local_last_run.as_ref().map(|idx| &idx.root));
    local.save(&cfg.local_root)?;

    println!("exporting sync commands");
    let commands = reconciler::reconcile(
        &mut local.root,
        local_last_run.as_ref().map(|idx| &idx.root),
        &mut remote.root,
        remote_last_run.as_ref().map(|idx| &idx.root),
        &local_deletions,
        &remote_deletions,
    );

    if commands.is_empty() {
        println!("no sync commands generated");
        let _tx = session.acquire_transmit().await;
        session.send_frame(&Frame::empty(OpCode::SyncComplete)).await?;
        return Ok(ExecuteOutcome::Continue);
    }

    run_commands(&session, &cfg, &mut local, &commands).await?;

    let _tx = session.acquire_transmit().await;
    session.send_frame(&Frame::empty(OpCode::SyncComplete)).await?;
    Ok(ExecuteOutcome::Continue)
}

fn prompt_yes_no(question: &str) -> Result<bool> {
    loop {
        print!("{question} (Y/N) ");
        io::stdout().flush().ok();
        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        let trimmed = answer.trim();
        if let Some(first) = trimmed.chars().next() {
            match first {
                'y' | 'Y' => return Ok(true),
                'n' | 'N' => return Ok(false),
                _ => continue,
            }
        }
    }
}

/// Prints/executes the reconciled commands according to `cfg.auto_sync`/
/// `cfg.dry_run`: a real terminal session sees two Y/N prompts; `--dry-run` auto-answers
/// print=Y/execute=N; `-y` auto-answers print=N/execute=Y.
async fn run_commands(
    session: &Session,
    cfg: &Config,
    local: &mut Index,
    commands: &[SyncCommand],
) -> Result<()> {
    println!("total commands: {}", commands.len());

    let print_answer = if cfg.auto_sync || cfg.dry_run {
        cfg.dry_run
    } else {
        prompt_yes_no("Print commands ?")?
    };
    if print_answer {
        for command in commands {
            println!("{}", command.render());
        }
    }

    let execute_answer = if cfg.auto_sync {
        println!("auto-sync mode enabled, executing commands without confirmation");
        true
    } else if cfg.dry_run {
        println!("dry run mode enabled, commands will not be executed");
        false
    } else {
        prompt_yes_no("Execute commands ?")?
    };

    if !cfg.auto_sync || cfg.dry_run {
        let export_path = cfg.local_root.join("sync_commands.sh");
        println!("exporting sync commands to file: {}", export_path.display());
        export_commands(&export_path, commands)?;
    }

    if execute_answer && (!cfg.dry_run || cfg.auto_sync) {
        for command in commands {
            execute_command(session, cfg, command).await?;
            if !command.remote && command.is_removal() {
                println!("removing path from local index: {}", command.src);
                index::remove_path(&mut local.root, &command.src, command.verb == Verb::Rmdir);
            }
        }
    }
    Ok(())
}

fn export_commands(path: &Path, commands: &[SyncCommand]) -> Result<()> {
    let mut out = String::new();
    for command in commands {
        out.push_str(&command.render());
        out.push_str("\n\r");
    }
    fs::write(path, out).with_context(|| format!("writing {}", path.display()))
}

/// Runs one reconciled command: direct filesystem operations for local
/// mkdir/rm/rmdir/cp, and wire commands for everything else.
async fn execute_command(session: &Session, cfg: &Config, command: &SyncCommand) -> Result<()> {
    if cfg.verbose {
        println!("{}", command.render());
    }
    let abs = |rel: &str| cfg.local_root.join(rel);
    match command.verb {
        Verb::Mkdir => {
            if command.remote {
                send_path_request(session, OpCode::MkdirRequest, &command.src).await?;
            } else {
                fs::create_dir_all(abs(&command.src))
                    .with_context(|| format!("creating directory {}", command.src))?;
            }
        }
        Verb::Rmdir => {
            if command.remote {
                send_path_request(session, OpCode::RmdirRequest, &command.src).await?;
            } else {
                let path = abs(&command.src);
                if path.is_dir() {
                    fs::remove_dir_all(&path).with_context(|| format!("removing directory {}", command.src))?;
                }
            }
        }
        Verb::Rm => {
            if command.remote {
                send_path_request(session, OpCode::RmRequest, &command.src).await?;
            } else {
                let path = abs(&command.src);
                if path.exists() {
                    fs::remove_file(&path).with_context(|| format!("removing file {}", command.src))?;
                }
            }
        }
        Verb::Cp => {
            let dst = command.dst.as_deref().unwrap_or(&command.src).to_string();
            if command.remote {
                let frame = protocol::encode_copy_frame(&command.src, &dst)?;
                let _tx = session.acquire_transmit().await;
                session.send_frame(&frame).await?;
            } else {
                let src_path = abs(&command.src);
                let dst_path = abs(&dst);
                if let Some(parent) = dst_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&src_path, &dst_path).with_context(|| format!("copying {} to {dst}", command.src))?;
            }
        }
        Verb::Push => {
            let dst = command.dst.as_deref().unwrap_or(&command.src).to_string();
            let frame = protocol::encode_path_frame(OpCode::PushFile, &dst)?;
            let _tx = session.acquire_transmit().await;
            session.send_frame(&frame).await?;
            session.send_file_stream(&abs(&command.src), &dst).await?;
        }
        Verb::Fetch => {
            let dst = command.dst.as_deref().unwrap_or(&command.src).to_string();
            let frame = protocol::encode_path_frame(OpCode::FetchFileRequest, &command.src)?;
            // Documented lock order: receive before transmit, so the reply
            // file stream can't race a later request acquiring receive first.
            let _rx = session.acquire_receive().await;
            {
                let _tx = session.acquire_transmit().await;
                session.send_frame(&frame).await?;
            }
            session.recv_file_stream(&abs(&dst)).await?;
        }
        Verb::Mv => bail!("move command has no wire or filesystem implementation: {}", command.render()),
    }
    Ok(())
}

async fn send_path_request(session: &Session, opcode: OpCode, path: &str) -> Result<()> {
    let frame = protocol::encode_path_frame(opcode, path)?;
    let _tx = session.acquire_transmit().await;
    session.send_frame(&frame).await
}

/// Listener-side handlers for inbound mutation requests: these always run
/// inline against ground truth, never offloaded.
pub async fn handle_mkdir_request(cfg: &Config, frame: &Frame) -> Result<ExecuteOutcome> {
    let path = protocol::decode_path_frame(frame, &cfg.limits)?;
    fs::create_dir_all(cfg.local_root.join(&path)).with_context(|| format!("creating directory {path}"))?;
    Ok(ExecuteOutcome::Continue)
}

pub async fn handle_rm_request(cfg: &Config, frame: &Frame) -> Result<ExecuteOutcome> {
    let path = protocol::decode_path_frame(frame, &cfg.limits)?;
    let abs = cfg.local_root.join(&path);
    if abs.exists() {
        fs::remove_file(&abs).with_context(|| format!("removing file {path}"))?;
    }
    Ok(ExecuteOutcome::Continue)
}

pub async fn handle_rmdir_request(cfg: &Config, frame: &Frame) -> Result<ExecuteOutcome> {
    let path = protocol::decode_path_frame(frame, &cfg.limits)?;
    let abs = cfg.local_root.join(&path);
    if abs.is_dir() {
        fs::remove_dir_all(&abs).with_context(|| format!("removing directory {path}"))?;
    }
    Ok(ExecuteOutcome::Continue)
}

pub async fn handle_remote_local_copy(cfg: &Config, frame: &Frame) -> Result<ExecuteOutcome> {
    let (src, dst) = protocol::decode_copy_frame(frame, &cfg.limits)?;
    let src_path = cfg.local_root.join(&src);
    let dst_path = cfg.local_root.join(&dst);
    if let Some(parent) = dst_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&src_path, &dst_path).with_context(|| format!("copying {src} to {dst}"))?;
    Ok(ExecuteOutcome::Continue)
}

/// The peer has asked us for a file: send it back as a raw file stream,
/// holding the transmit lock for the whole reply.
pub async fn handle_fetch_file_request(session: &Session, cfg: &Config, frame: &Frame) -> Result<ExecuteOutcome> {
    let path = protocol::decode_path_frame(frame, &cfg.limits)?;
    let abs = cfg.local_root.join(&path);
    if !abs.is_file() {
        let message = protocol::encode_message_frame(&format!("file not found: {path}"))?;
        let _tx = session.acquire_transmit().await;
        session.send_frame(&message).await?;
        return Ok(ExecuteOutcome::Continue);
    }
    let _tx = session.acquire_transmit().await;
    session.send_file_stream(&abs, &path).await?;
    Ok(ExecuteOutcome::Continue)
}

/// The peer is pushing a file to us: the frame names the destination, and
/// the file stream follows immediately, still under the receive lock.
pub async fn handle_push_file(session: &Session, cfg: &Config, frame: &Frame) -> Result<ExecuteOutcome> {
    let path = protocol::decode_path_frame(frame, &cfg.limits)?;
    let _rx = session.acquire_receive().await;
    session.recv_file_stream(&cfg.local_root.join(&path)).await?;
    Ok(ExecuteOutcome::Continue)
}

pub async fn handle_message(cfg: &Config, frame: &Frame) -> Result<ExecuteOutcome> {
    let text = protocol::decode_message_frame(frame, &cfg.limits)?;
    let _ = cfg;
    println!("[peer] {text}");
    Ok(ExecuteOutcome::Continue)
}

/// Listener-side reply to the initiator's `SyncComplete`: acknowledge with
/// `SyncDone` so the initiator can terminate its session.
pub async fn handle_sync_complete(session: &Session, cfg: &Config) -> Result<ExecuteOutcome> {
    println!("sync complete for {}", cfg.local_root.display());
    let _tx = session.acquire_transmit().await;
    session.send_frame(&Frame::empty(OpCode::SyncDone)).await?;
    if cfg.exit_after_sync {
        return Ok(ExecuteOutcome::Terminal);
    }
    Ok(ExecuteOutcome::Continue)
}

/// Initiator-side handling of the listener's `SyncDone`: the session is over.
pub fn handle_sync_done(cfg: &Config) -> ExecuteOutcome {
    println!("sync done for {}", cfg.local_root.display());
    let _ = cfg;
    ExecuteOutcome::Terminal
}
