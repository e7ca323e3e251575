use std::env;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};

pub const DEFAULT_INTERPRETER: &str = "python";
pub const DEFAULT_OUTPUT_STEM: &str = "example_diagram";
/// Appears in the diagrams/graphviz traceback when `dot` is not installed.
pub const GRAPHVIZ_MISSING_MARKER: &str = "ExecutableNotFound";

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long output readers may keep going after a timed-out run is killed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Program plus leading arguments; the source path is appended.
    pub interpreter: Vec<String>,
    pub timeout: Option<Duration>,
    /// Parent for the temporary source file and the scratch directory.
    pub temp_root: Option<PathBuf>,
    /// File stem the diagram code is expected to write, `.png` appended.
    pub output_stem: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            interpreter: vec![DEFAULT_INTERPRETER.to_string()],
            timeout: None,
            temp_root: None,
            output_stem: DEFAULT_OUTPUT_STEM.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFailure {
    GraphvizMissing,
    NonZeroExit,
    TimedOut,
    MissingImage,
    /// The expected file exists but does not decode as an image.
    UnreadableImage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RenderedImage {
    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", BASE64.encode(&self.bytes))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &self.bytes).with_context(|| format!("failed to write {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct RenderRun {
    pub interpreter: Vec<String>,
    pub code_sha256: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub failure: Option<RenderFailure>,
    pub image: Option<RenderedImage>,
    pub elapsed: Duration,
}

/// Runs diagram source as a child process and collects the PNG it leaves
/// behind.
///
/// Each run gets its own scratch working directory, so two runs never see
/// each other's output. The source file and the scratch directory are both
/// removed before `run` returns, whatever the outcome.
#[derive(Debug, Clone, Default)]
pub struct Renderer {
    config: RenderConfig,
}

impl Renderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn output_file_name(&self) -> String {
        format!("{}.png", self.config.output_stem)
    }

    pub fn run(&self, code: &str) -> Result<RenderRun> {
        let Some((program, leading_args)) = self.config.interpreter.split_first() else {
            bail!("no interpreter configured");
        };
        let temp_root = match self.config.temp_root.as_ref() {
            Some(root) => {
                fs::create_dir_all(root)
                    .with_context(|| format!("failed to create {}", root.display()))?;
                root.clone()
            }
            None => env::temp_dir(),
        };

        let scratch = tempfile::Builder::new()
            .prefix("diagen-render-")
            .tempdir_in(&temp_root)
            .context("failed to create render scratch directory")?;
        let mut source = tempfile::Builder::new()
            .prefix("diagram-")
            .suffix(".py")
            .tempfile_in(&temp_root)
            .context("failed to create temporary diagram source")?;
        source.write_all(code.as_bytes())?;
        source.flush()?;
        let source_path = source.into_temp_path();

        let started = Instant::now();
        let mut command = Command::new(program);
        command
            .args(leading_args)
            .arg(&*source_path)
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a timeout also reaches `dot` and friends.
            command.process_group(0);
        }
        let child = command
            .spawn()
            .with_context(|| format!("failed to start interpreter '{program}'"))?;
        let finished = wait_for_child(child, self.config.timeout)?;
        let elapsed = started.elapsed();
        drop(source_path);

        let mut failure = if finished.timed_out {
            Some(RenderFailure::TimedOut)
        } else if !finished.status.success() {
            if finished.stderr.contains(GRAPHVIZ_MISSING_MARKER) {
                Some(RenderFailure::GraphvizMissing)
            } else {
                Some(RenderFailure::NonZeroExit)
            }
        } else {
            None
        };

        let mut image = None;
        if failure.is_none() {
            let file_name = self.output_file_name();
            let image_path = scratch.path().join(&file_name);
            if image_path.is_file() {
                match load_image(&image_path, file_name) {
                    Ok(loaded) => image = Some(loaded),
                    Err(_) => failure = Some(RenderFailure::UnreadableImage),
                }
            } else {
                failure = Some(RenderFailure::MissingImage);
            }
        }

        Ok(RenderRun {
            interpreter: self.config.interpreter.clone(),
            code_sha256: code_sha256(code),
            exit_code: finished.status.code(),
            stdout: finished.stdout,
            stderr: finished.stderr,
            failure,
            image,
            elapsed,
        })
    }
}

pub fn code_sha256(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

fn load_image(path: &Path, file_name: String) -> Result<RenderedImage> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let decoded = image::load_from_memory(&bytes)
        .with_context(|| format!("{} is not a readable image", path.display()))?;
    Ok(RenderedImage {
        file_name,
        width: decoded.width(),
        height: decoded.height(),
        bytes,
    })
}

struct FinishedChild {
    status: ExitStatus,
    stdout: String,
    stderr: String,
    timed_out: bool,
}

fn wait_for_child(mut child: Child, timeout: Option<Duration>) -> Result<FinishedChild> {
    let stdout = child.stdout.take().map(drain_pipe);
    let stderr = child.stderr.take().map(drain_pipe);

    let mut timed_out = false;
    let status = match timeout {
        None => child.wait().context("failed waiting for interpreter")?,
        Some(limit) => {
            let deadline = Instant::now() + limit;
            loop {
                if let Some(status) = child.try_wait()? {
                    break status;
                }
                if Instant::now() >= deadline {
                    timed_out = true;
                    kill_process_tree(&mut child);
                    break child.wait().context("failed waiting for interpreter")?;
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    };

    // Descendants that escaped the kill may still hold the pipes open.
    let drain_deadline = timed_out.then(|| Instant::now() + DRAIN_GRACE);
    Ok(FinishedChild {
        status,
        stdout: collect_pipe(stdout, drain_deadline),
        stderr: collect_pipe(stderr, drain_deadline),
        timed_out,
    })
}

fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: plain syscall on the group the child leads; no memory is shared.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
}

struct PipeDrain {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> PipeDrain {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink = buffer.clone();
    let handle = thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => {
                    if let Ok(mut buf) = sink.lock() {
                        buf.extend_from_slice(&chunk[..read]);
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    PipeDrain { buffer, handle }
}

/// Waits for the reader to hit end of file, or until `deadline`, then returns
/// whatever was read.
fn collect_pipe(drain: Option<PipeDrain>, deadline: Option<Instant>) -> String {
    let Some(drain) = drain else {
        return String::new();
    };
    match deadline {
        None => {
            let _ = drain.handle.join();
        }
        Some(deadline) => {
            while !drain.handle.is_finished() && Instant::now() < deadline {
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
    let bytes = drain
        .buffer
        .lock()
        .map(|buf| buf.clone())
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}
