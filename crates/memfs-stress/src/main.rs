// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use memfs_core::{
    FixedMemory, FsError, FsStats, Mount, MountConfig, Node, NodeSpec, NodeType, Owner, PageLimit,
    SystemBudget, COOKIE_DOT, COOKIE_EOF, PAGE_SIZE,
};
use rand::{rngs::SmallRng, Rng, RngCore, SeedableRng};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Plain names each worker draws from, shared across workers.
const NAME_POOL: u64 = 128;
/// Files are kept within this many pages.
const MAX_FILE_PAGES: u64 = 16;

fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => {
            let ctx = run_workload(args)?;
            if let Some(path) = ctx.json_output.clone() {
                let file = File::create(&path)
                    .with_context(|| format!("failed to create report {}", path.display()))?;
                serde_json::to_writer_pretty(file, &ctx.report)?;
            }
            write_json_to_stdout(&ctx.report)?;
            if ctx.report.status != "passed" {
                bail!("memfs stress run failed");
            }
        }
    }
    Ok(())
}

fn write_json_to_stdout<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    out.flush()?;
    Ok(())
}

#[derive(Parser)]
#[command(author, version, about = "MemFS multi-threaded stress workload runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Run(RunArgs),
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Number of worker threads to spawn
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Operations each worker performs
    #[arg(long, default_value_t = 5000)]
    ops_per_thread: u64,

    /// Mount page ceiling (overrides --options)
    #[arg(long)]
    max_pages: Option<u64>,

    /// Mount node ceiling (overrides --options)
    #[arg(long)]
    max_nodes: Option<u64>,

    /// Use a fixed memory gauge reporting this many free pages instead of the host's
    #[arg(long)]
    free_pages: Option<u64>,

    /// Reserve floor kept back when --free-pages is given
    #[arg(long, default_value_t = 0)]
    reserved_pages: u64,

    /// tmpfs-style mount options, e.g. "size=64m,nr_inodes=10k"
    #[arg(long)]
    options: Option<String>,

    /// JSON mount configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed for the workers' generators; derived from the clock when absent
    #[arg(long)]
    seed: Option<u64>,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Create,
    Write,
    Read,
    Truncate,
    PunchHole,
    Unlink,
    Rename,
    Readdir,
    Handle,
}

impl Operation {
    fn label(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Write => "write",
            Operation::Read => "read",
            Operation::Truncate => "truncate",
            Operation::PunchHole => "punch_hole",
            Operation::Unlink => "unlink",
            Operation::Rename => "rename",
            Operation::Readdir => "readdir",
            Operation::Handle => "handle",
        }
    }
}

#[derive(Default, Serialize, Clone)]
struct OperationStats {
    create: u64,
    write: u64,
    read: u64,
    truncate: u64,
    punch_hole: u64,
    unlink: u64,
    rename: u64,
    readdir: u64,
    handle: u64,
}

impl OperationStats {
    fn increment(&mut self, op: Operation) {
        match op {
            Operation::Create => self.create += 1,
            Operation::Write => self.write += 1,
            Operation::Read => self.read += 1,
            Operation::Truncate => self.truncate += 1,
            Operation::PunchHole => self.punch_hole += 1,
            Operation::Unlink => self.unlink += 1,
            Operation::Rename => self.rename += 1,
            Operation::Readdir => self.readdir += 1,
            Operation::Handle => self.handle += 1,
        }
    }

    fn total(&self) -> u64 {
        self.create
            + self.write
            + self.read
            + self.truncate
            + self.punch_hole
            + self.unlink
            + self.rename
            + self.readdir
            + self.handle
    }
}

impl std::ops::AddAssign<&OperationStats> for OperationStats {
    fn add_assign(&mut self, other: &OperationStats) {
        self.create += other.create;
        self.write += other.write;
        self.read += other.read;
        self.truncate += other.truncate;
        self.punch_hole += other.punch_hole;
        self.unlink += other.unlink;
        self.rename += other.rename;
        self.readdir += other.readdir;
        self.handle += other.handle;
    }
}

#[derive(Debug, Default, Serialize, Clone)]
struct VerificationSummary {
    directories: u64,
    files: u64,
    reachable_nodes: u64,
    data_pages_reported: u64,
    data_pages_counted: u64,
    duplicate_names: u64,
    duplicate_cookies: u64,
    nodes_after_unmount: u64,
    data_pages_after_unmount: u64,
    problems: Vec<String>,
}

#[derive(Serialize, Clone)]
struct RunReport {
    phase: String,
    threads: usize,
    ops_per_thread: u64,
    seed: u64,
    config: MountConfig,
    start_time: String,
    end_time: String,
    operations: OperationStats,
    total_ops: u64,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
    stats_before_unmount: FsStats,
    verification: VerificationSummary,
    status: String,
}

struct RunContext {
    report: RunReport,
    json_output: Option<PathBuf>,
}

fn mount_config(args: &RunArgs) -> Result<MountConfig> {
    let mut config = match (&args.config, &args.options) {
        (Some(_), Some(_)) => bail!("--config and --options are mutually exclusive"),
        (Some(path), None) => MountConfig::from_json_file(path)
            .with_context(|| format!("failed to load mount config {}", path.display()))?,
        (None, Some(options)) => MountConfig::from_options(options)
            .with_context(|| format!("invalid mount options {:?}", options))?,
        (None, None) => MountConfig::default(),
    };
    if let Some(pages) = args.max_pages {
        config.max_pages = PageLimit::Pages(pages);
    }
    if args.max_nodes.is_some() {
        config.max_nodes = args.max_nodes;
    }
    if config.read_only {
        bail!("a read-only mount cannot be stressed");
    }
    Ok(config)
}

fn run_workload(args: RunArgs) -> Result<RunContext> {
    if args.threads == 0 {
        bail!("--threads must be at least 1");
    }
    let config = mount_config(&args)?;
    let budget = match args.free_pages {
        Some(free) => SystemBudget::new(Arc::new(FixedMemory::new(free, free)), args.reserved_pages),
        None => SystemBudget::host(),
    };
    let mount = Mount::new(config.clone(), Arc::new(budget));
    let root = mount.root();
    let dirs: Vec<Arc<Node>> = (0..4)
        .map(|i| {
            mount
                .create(&root, format!("d{}", i).as_bytes(), NodeSpec::Directory, Owner::default(), 0o755)
                .with_context(|| format!("failed to create working directory d{}", i))
        })
        .collect::<Result<_>>()?;
    let dirs = Arc::new(dirs);

    let seed = args.seed.unwrap_or_else(|| {
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64
            ^ ((std::process::id() as u64) << 32)
    });
    info!(
        "memfs workload: threads={}, ops_per_thread={}, seed={}, max_pages={:?}, max_nodes={:?}",
        args.threads,
        args.ops_per_thread,
        seed,
        mount.statfs().pages_max,
        config.max_nodes
    );

    let start_time = chrono::Utc::now();
    let mut handles = Vec::with_capacity(args.threads);
    for worker_id in 0..args.threads {
        let worker = Worker {
            id: worker_id,
            mount: mount.clone(),
            dirs: Arc::clone(&dirs),
            ops: args.ops_per_thread,
            rng_seed: seed ^ (worker_id as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15),
        };
        handles.push(std::thread::spawn(move || worker.run()));
    }

    let mut aggregate_stats = OperationStats::default();
    let mut benign_errors: HashMap<String, u64> = HashMap::new();
    let mut fatal_errors: HashMap<String, u64> = HashMap::new();

    for handle in handles {
        match handle.join() {
            Ok(result) => {
                aggregate_stats += &result.stats;
                merge_counts(&mut benign_errors, &result.benign_errors);
                merge_counts(&mut fatal_errors, &result.fatal_errors);
            }
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                *fatal_errors.entry("thread_panic".to_string()).or_insert(0) += 1;
                warn!("worker thread panicked: {}", msg);
            }
        }
    }

    let mut verification = verify_tree(&mount)?;
    let stats_before_unmount = mount.statfs();
    mount.unmount(true).context("forced unmount failed")?;
    let after = mount.statfs();
    verification.nodes_after_unmount = after.nodes_in_use;
    verification.data_pages_after_unmount = after.data_pages;
    if after.nodes_in_use != 0 || after.data_pages != 0 {
        verification.problems.push(format!(
            "unmount left {} nodes and {} data pages",
            after.nodes_in_use, after.data_pages
        ));
    }
    let end_time = chrono::Utc::now();

    let status = if fatal_errors.is_empty() && verification.problems.is_empty() {
        "passed".to_string()
    } else {
        for problem in &verification.problems {
            warn!("verification: {}", problem);
        }
        "failed".to_string()
    };

    let report = RunReport {
        phase: "memfs".to_string(),
        threads: args.threads,
        ops_per_thread: args.ops_per_thread,
        seed,
        config,
        start_time: start_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        end_time: end_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        operations: aggregate_stats.clone(),
        total_ops: aggregate_stats.total(),
        benign_errors,
        fatal_errors,
        stats_before_unmount,
        verification,
        status,
    };

    Ok(RunContext {
        report,
        json_output: args.json_output,
    })
}

fn merge_counts(target: &mut HashMap<String, u64>, source: &HashMap<String, u64>) {
    for (key, value) in source {
        *target.entry(key.clone()).or_insert(0) += value;
    }
}

/// Walk the quiescent tree, checking every cookie stream and the page totals.
fn verify_tree(mount: &Mount) -> Result<VerificationSummary> {
    let mut summary = VerificationSummary::default();
    let mut pending = vec![mount.root()];
    while let Some(dir) = pending.pop() {
        summary.directories += 1;
        let mut names = HashSet::new();
        let mut cookies = HashSet::new();
        let mut cookie = COOKIE_DOT;
        loop {
            let batch = mount
                .readdir(&dir, cookie, 7)
                .with_context(|| format!("readdir of {} failed", dir.id()))?;
            for info in batch.entries {
                if info.name == b"." || info.name == b".." {
                    continue;
                }
                if !cookies.insert(info.cookie) {
                    summary.duplicate_cookies += 1;
                }
                if !names.insert(info.name.clone()) {
                    summary.duplicate_names += 1;
                    continue;
                }
                let entry = mount
                    .lookup(&dir, &info.name)
                    .with_context(|| format!("listed entry {:?} not found", String::from_utf8_lossy(&info.name)))?;
                let Some(node) = entry.node() else { continue };
                summary.reachable_nodes += 1;
                match node.node_type() {
                    NodeType::Directory => pending.push(Arc::clone(node)),
                    NodeType::Regular => {
                        summary.files += 1;
                        summary.data_pages_counted += mount.getattr(node)?.pages;
                    }
                    _ => {}
                }
            }
            if batch.next_cookie == COOKIE_EOF {
                break;
            }
            cookie = batch.next_cookie;
        }
    }

    let stats = mount.statfs();
    summary.data_pages_reported = stats.data_pages;
    if summary.data_pages_counted != stats.data_pages {
        summary.problems.push(format!(
            "statfs reports {} data pages but files hold {}",
            stats.data_pages, summary.data_pages_counted
        ));
    }
    if summary.duplicate_cookies + summary.duplicate_names > 0 {
        summary.problems.push(format!(
            "readdir repeated {} cookies and {} names",
            summary.duplicate_cookies, summary.duplicate_names
        ));
    }
    // Hard links are never made, so each reachable node is named once.
    if stats.nodes_in_use != summary.reachable_nodes + 1 {
        summary.problems.push(format!(
            "{} nodes accounted but {} reachable",
            stats.nodes_in_use,
            summary.reachable_nodes + 1
        ));
    }
    if stats.handles != 0 {
        summary.problems.push(format!("{} handles still bound", stats.handles));
    }
    Ok(summary)
}

struct Worker {
    id: usize,
    mount: Mount,
    dirs: Arc<Vec<Arc<Node>>>,
    ops: u64,
    rng_seed: u64,
}

struct WorkerResult {
    stats: OperationStats,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
}

enum OperationResult {
    Completed,
    Benign { label: String },
    Fatal { label: String, detail: String },
}

impl Worker {
    fn run(self) -> WorkerResult {
        let mut rng = SmallRng::seed_from_u64(self.rng_seed);
        let mut stats = OperationStats::default();
        let mut benign_errors: HashMap<String, u64> = HashMap::new();
        let mut fatal_errors: HashMap<String, u64> = HashMap::new();

        for _ in 0..self.ops {
            let op = self.pick_operation(&mut rng);
            let result = match op {
                Operation::Create => self.create(&mut rng),
                Operation::Write => self.write(&mut rng),
                Operation::Read => self.read(&mut rng),
                Operation::Truncate => self.truncate(&mut rng),
                Operation::PunchHole => self.punch_hole(&mut rng),
                Operation::Unlink => self.unlink(&mut rng),
                Operation::Rename => self.rename(&mut rng),
                Operation::Readdir => self.readdir(&mut rng),
                Operation::Handle => self.handle(&mut rng),
            };

            match result {
                OperationResult::Completed => stats.increment(op),
                OperationResult::Benign { label } => {
                    *benign_errors.entry(label).or_insert(0) += 1;
                }
                OperationResult::Fatal { label, detail } => {
                    *fatal_errors.entry(label.clone()).or_insert(0) += 1;
                    debug!("worker {} fatal {}: {}", self.id, label, detail);
                }
            }
        }

        WorkerResult {
            stats,
            benign_errors,
            fatal_errors,
        }
    }

    fn pick_operation(&self, rng: &mut SmallRng) -> Operation {
        match rng.gen_range(0..100) {
            0..=19 => Operation::Create,
            20..=39 => Operation::Write,
            40..=51 => Operation::Read,
            52..=59 => Operation::Truncate,
            60..=65 => Operation::PunchHole,
            66..=79 => Operation::Unlink,
            80..=87 => Operation::Rename,
            88..=93 => Operation::Readdir,
            _ => Operation::Handle,
        }
    }

    fn pick_dir(&self, rng: &mut SmallRng) -> &Arc<Node> {
        &self.dirs[rng.gen_range(0..self.dirs.len())]
    }

    /// A pool name; one in four is drawn from a set whose members all hash alike.
    fn pick_name(&self, rng: &mut SmallRng) -> Vec<u8> {
        if rng.gen_bool(0.25) {
            let bits: u8 = rng.gen_range(0..8);
            (0..3)
                .flat_map(|i| if bits & (1 << i) == 0 { *b"aa" } else { *b"b@" })
                .collect()
        } else {
            format!("f{:03}", rng.gen_range(0..NAME_POOL)).into_bytes()
        }
    }

    /// Resolve a random pool name to a regular file.
    fn pick_file(&self, rng: &mut SmallRng, op: Operation) -> Result<Arc<Node>, OperationResult> {
        let dir = self.pick_dir(rng);
        let name = self.pick_name(rng);
        let entry = self
            .mount
            .lookup(dir, &name)
            .map_err(|err| classify_error(op, err))?;
        match entry.node() {
            Some(node) if node.node_type() == NodeType::Regular => Ok(Arc::clone(node)),
            _ => Err(OperationResult::Benign {
                label: format!("{}_not_regular", op.label()),
            }),
        }
    }

    fn create(&self, rng: &mut SmallRng) -> OperationResult {
        let dir = self.pick_dir(rng);
        let name = self.pick_name(rng);
        let spec = if rng.gen_bool(0.15) {
            let len = rng.gen_range(1..=96);
            NodeSpec::Symlink {
                target: vec![b't'; len],
            }
        } else {
            NodeSpec::Regular
        };
        complete(
            Operation::Create,
            self.mount.create(dir, &name, spec, Owner::new(self.id as u32, 0), 0o644),
        )
    }

    fn write(&self, rng: &mut SmallRng) -> OperationResult {
        let node = match self.pick_file(rng, Operation::Write) {
            Ok(node) => node,
            Err(result) => return result,
        };
        let limit = MAX_FILE_PAGES * PAGE_SIZE as u64;
        let len = rng.gen_range(1..=2 * PAGE_SIZE);
        let offset = rng.gen_range(0..limit - len as u64);
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        complete(Operation::Write, self.mount.write(&node, offset, &data))
    }

    fn read(&self, rng: &mut SmallRng) -> OperationResult {
        let node = match self.pick_file(rng, Operation::Read) {
            Ok(node) => node,
            Err(result) => return result,
        };
        let mut buf = vec![0u8; rng.gen_range(1..=2 * PAGE_SIZE)];
        let offset = rng.gen_range(0..MAX_FILE_PAGES * PAGE_SIZE as u64);
        complete(Operation::Read, self.mount.read(&node, offset, &mut buf))
    }

    fn truncate(&self, rng: &mut SmallRng) -> OperationResult {
        let node = match self.pick_file(rng, Operation::Truncate) {
            Ok(node) => node,
            Err(result) => return result,
        };
        let size = rng.gen_range(0..=MAX_FILE_PAGES * PAGE_SIZE as u64);
        complete(Operation::Truncate, self.mount.truncate(&node, size))
    }

    fn punch_hole(&self, rng: &mut SmallRng) -> OperationResult {
        let node = match self.pick_file(rng, Operation::PunchHole) {
            Ok(node) => node,
            Err(result) => return result,
        };
        let offset = rng.gen_range(0..MAX_FILE_PAGES * PAGE_SIZE as u64);
        let len = rng.gen_range(1..=4 * PAGE_SIZE as u64);
        complete(Operation::PunchHole, self.mount.punch_hole(&node, offset, len))
    }

    fn unlink(&self, rng: &mut SmallRng) -> OperationResult {
        let dir = self.pick_dir(rng);
        let name = self.pick_name(rng);
        complete(Operation::Unlink, self.mount.unlink(dir, &name))
    }

    fn rename(&self, rng: &mut SmallRng) -> OperationResult {
        let src = self.pick_dir(rng);
        let src_name = self.pick_name(rng);
        let dst = self.pick_dir(rng);
        let dst_name = self.pick_name(rng);
        complete(Operation::Rename, self.mount.rename(src, &src_name, dst, &dst_name))
    }

    fn readdir(&self, rng: &mut SmallRng) -> OperationResult {
        let dir = self.pick_dir(rng);
        let batch = rng.gen_range(1..=16);
        let mut cookie = COOKIE_DOT;
        loop {
            match self.mount.readdir(dir, cookie, batch) {
                Ok(page) if page.next_cookie == COOKIE_EOF => return OperationResult::Completed,
                Ok(page) => cookie = page.next_cookie,
                Err(err) => return classify_error(Operation::Readdir, err),
            }
        }
    }

    fn handle(&self, rng: &mut SmallRng) -> OperationResult {
        let node = match self.pick_file(rng, Operation::Handle) {
            Ok(node) => node,
            Err(result) => return result,
        };
        let handle = match self.mount.get_handle(&node) {
            Ok(handle) => handle,
            Err(err) => return classify_error(Operation::Handle, err),
        };
        let mut buf = [0u8; 64];
        let result = self.mount.read(handle.node(), 0, &mut buf);
        self.mount.drop_handle(handle);
        complete(Operation::Handle, result)
    }
}

fn complete<T>(op: Operation, result: Result<T, FsError>) -> OperationResult {
    match result {
        Ok(_) => OperationResult::Completed,
        Err(err) => classify_error(op, err),
    }
}

fn classify_error(op: Operation, err: FsError) -> OperationResult {
    let kind = match err {
        FsError::OutOfNodes | FsError::OutOfQuota | FsError::OutOfMemory => "enospc",
        FsError::NotFound => "not_found",
        FsError::AlreadyExists => "exists",
        FsError::IsADirectory | FsError::NotADirectory => "wrong_type",
        FsError::NotEmpty => "not_empty",
        FsError::Busy => "busy",
        other => {
            return OperationResult::Fatal {
                label: format!("{}_errno_{}", op.label(), other.errno()),
                detail: other.to_string(),
            };
        }
    };
    OperationResult::Benign {
        label: format!("{}_{}", op.label(), kind),
    }
}
