#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::env;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use xd_alloc::{DirInode, Extent};
use xd_block::{BlockDevice, Buf, BufOps};
use xd_core::{DirMount, MountConfig};
use xd_dir::{BlockTrailer, DaArgs, DirContext, ReadaheadBufOps, Record, RecordWalk, data_init};
use xd_error::DirError;
use xd_ondisk::{DataMagic, Dir3BlkHdr, DirOps};
use xd_types::{BlockNumber, DirBlock, InodeNumber};

// ── Output shapes ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    block: u64,
    magic: String,
    format: &'static str,
    ops: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    v3: Option<V3Header>,
    bestfree: Vec<(u16, u16)>,
    records: Vec<RecordOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    walk_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trailer: Option<TrailerOutput>,
    verify: BlockStatus,
}

#[derive(Debug, Serialize)]
struct V3Header {
    crc: u32,
    blkno: u64,
    lsn: u64,
    uuid: String,
    owner: u64,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum RecordOutput {
    Entry {
        offset: usize,
        ino: u64,
        name: String,
        ftype: String,
        size: usize,
    },
    Unused {
        offset: usize,
        length: usize,
    },
}

#[derive(Debug, Serialize)]
struct TrailerOutput {
    count: u32,
    stale: u32,
    leaf_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum BlockStatus {
    Ok,
    Corrupted { offset: usize, detail: String },
    BadCrc,
    Error { detail: String },
}

#[derive(Debug, Serialize)]
struct BlockResult {
    block: u64,
    #[serde(flatten)]
    status: BlockStatus,
}

#[derive(Debug, Serialize)]
struct VerifyReport {
    checked: usize,
    failed: usize,
    blocks: Vec<BlockResult>,
}

#[derive(Debug, Serialize)]
struct MkblockOutput {
    block: u64,
    magic: String,
    owner: u64,
    lsn: u64,
}

// ── Argument parsing ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Options {
    image: Option<PathBuf>,
    block: Option<u64>,
    blocks: Option<Range<u64>>,
    config: Option<PathBuf>,
    owner: u64,
    json: bool,
}

impl Options {
    fn parse(command: &str, args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut opts = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--json" => opts.json = true,
                "--block" => opts.block = Some(parse_u64(&value(&mut args, "--block")?)?),
                "--blocks" => opts.blocks = Some(parse_range(&value(&mut args, "--blocks")?)?),
                "--owner" => opts.owner = parse_u64(&value(&mut args, "--owner")?)?,
                "--config" => opts.config = Some(PathBuf::from(value(&mut args, "--config")?)),
                flag if flag.starts_with("--") => bail!("{command}: unknown option {flag}"),
                _ if opts.image.is_none() => opts.image = Some(PathBuf::from(arg)),
                _ => bail!("{command}: unexpected argument {arg}"),
            }
        }
        Ok(opts)
    }

    fn image(&self, command: &str) -> Result<&Path> {
        self.image
            .as_deref()
            .with_context(|| format!("{command} requires an image path"))
    }

    fn block(&self, command: &str) -> Result<u64> {
        self.block
            .with_context(|| format!("{command} requires --block N"))
    }
}

fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next()
        .with_context(|| format!("{flag} requires a value"))
}

/// Decimal or `0x`-prefixed hexadecimal.
fn parse_u64(text: &str) -> Result<u64> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("invalid number: {text}"))
}

/// `a..b`, end exclusive.
fn parse_range(text: &str) -> Result<Range<u64>> {
    let Some((start, end)) = text.split_once("..") else {
        bail!("invalid block range {text}: expected START..END");
    };
    let range = parse_u64(start)?..parse_u64(end)?;
    if range.is_empty() {
        bail!("empty block range {text}");
    }
    Ok(range)
}

// ── Entry point ─────────────────────────────────────────────────────────────

fn main() {
    init_logging();
    if let Err(error) = run(env::args().skip(1)) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("XD_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(mut args: impl Iterator<Item = String>) -> Result<()> {
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "inspect" => {
            let opts = Options::parse("inspect", args)?;
            let output = inspect(&opts)?;
            if opts.json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                print_inspect(&output);
            }
            Ok(())
        }
        "verify" => {
            let opts = Options::parse("verify", args)?;
            let report = verify(&opts)?;
            if opts.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_verify(&report);
            }
            if report.failed > 0 {
                bail!("{} of {} directory blocks failed verification", report.failed, report.checked);
            }
            Ok(())
        }
        "mkblock" => {
            let opts = Options::parse("mkblock", args)?;
            let output = mkblock(&opts)?;
            if opts.json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!(
                    "block {}: initialised {} (owner {:#x}, lsn {:#x})",
                    output.block, output.magic, output.owner, output.lsn
                );
            }
            Ok(())
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("xdctl\n");
    println!("USAGE:");
    println!("  xdctl inspect <image> --block N [--config <file>] [--json]");
    println!("  xdctl verify <image> [--blocks START..END] [--config <file>] [--json]");
    println!("  xdctl mkblock <image> --block N [--owner INO] [--config <file>] [--json]");
    println!();
    println!("Logging goes to stderr; set XD_LOG (default: warn).");
}

// ── Mounting ────────────────────────────────────────────────────────────────

/// Mount the image described by `opts`. Read-only commands run one log
/// cycle ahead of the configured one so blocks stamped by an earlier
/// session are never ahead of the journal head.
fn open(opts: &Options, command: &str, read_only: bool) -> Result<DirMount> {
    let image = opts.image(command)?;
    let mut config = match &opts.config {
        Some(path) => MountConfig::from_json_file(path)
            .with_context(|| format!("failed to load mount config {}", path.display()))?,
        None => MountConfig::default(),
    };
    if read_only {
        config.log_cycle = config.log_cycle.saturating_add(1);
    }
    DirMount::open_file(config, image)
        .with_context(|| format!("failed to open {}", image.display()))
}

/// Read the filesystem blocks of one directory block straight from the
/// device, bypassing the cache and its verifiers.
fn read_dir_block(mount: &DirMount, daddr: u64) -> Result<Buf> {
    let geo = mount.ctx().geo;
    let dev = mount.cache().device();
    let end = daddr + u64::from(geo.fsbcount);
    if end > dev.block_count() {
        bail!("block {daddr} is beyond the end of the image ({} blocks)", dev.block_count());
    }
    let mut data = Vec::with_capacity(geo.blksize_usize());
    for block in daddr..end {
        let raw = dev
            .read_block(BlockNumber(block))
            .with_context(|| format!("failed to read block {block}"))?;
        data.extend_from_slice(raw.as_slice());
    }
    Ok(Buf::new(BlockNumber(daddr), data))
}

fn check(ctx: &Arc<DirContext>, buf: &mut Buf) -> BlockStatus {
    match ReadaheadBufOps::new(Arc::clone(ctx)).verify_read(buf) {
        Ok(()) => BlockStatus::Ok,
        Err(DirError::Corrupted { offset, detail, .. }) => BlockStatus::Corrupted { offset, detail },
        Err(DirError::BadCrc { .. }) => BlockStatus::BadCrc,
        Err(err) => BlockStatus::Error {
            detail: err.to_string(),
        },
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

fn inspect(opts: &Options) -> Result<InspectOutput> {
    let block = opts.block("inspect")?;
    let mount = open(opts, "inspect", true)?;
    let ctx = mount.ctx();
    let buf = read_dir_block(&mount, block)?;
    let data = buf.data();

    let magic = DataMagic::read(data).with_context(|| format!("block {block} is not a directory data block"))?;
    // Decode with the table matching the block's own header, so a block of
    // another format is still readable.
    let ops = match (magic.is_v3(), ctx.ops) {
        (true, _) => DirOps::V3,
        (false, DirOps::V3) => DirOps::V2Ftype,
        (false, ops) => ops,
    };
    debug!(block, ?magic, ?ops, "inspecting directory block");

    let v3 = if magic.is_v3() {
        let hdr = Dir3BlkHdr::parse(data)?;
        Some(V3Header {
            crc: hdr.crc,
            blkno: hdr.blkno,
            lsn: hdr.lsn,
            uuid: hdr.uuid.to_string(),
            owner: hdr.owner,
        })
    } else {
        None
    };

    let bestfree = xd_dir::bestfree::load(ops, &buf)?
        .iter()
        .map(|slot| (slot.offset, slot.length))
        .collect();

    let mut records = Vec::new();
    let mut walk_error = None;
    match RecordWalk::new(ops, block, data) {
        Ok(walk) => {
            for record in walk {
                match record {
                    Ok(Record::Entry {
                        offset,
                        ino,
                        name,
                        ftype,
                        size,
                    }) => records.push(RecordOutput::Entry {
                        offset,
                        ino,
                        name: String::from_utf8_lossy(name).into_owned(),
                        ftype: format!("{ftype:?}"),
                        size,
                    }),
                    Ok(Record::Unused { offset, length }) => {
                        records.push(RecordOutput::Unused { offset, length });
                    }
                    Err(err) => {
                        walk_error = Some(err.to_string());
                        break;
                    }
                }
            }
        }
        Err(err) => walk_error = Some(err.to_string()),
    }

    let trailer = if magic.is_block() {
        BlockTrailer::parse(&ctx.geo, data).ok().map(|trailer| TrailerOutput {
            count: trailer.tail.count,
            stale: trailer.tail.stale,
            leaf_offset: trailer.leaf_offset,
        })
    } else {
        None
    };

    let mut scratch = Buf::new(BlockNumber(block), data.to_vec());
    let verify = check(ctx, &mut scratch);

    Ok(InspectOutput {
        block,
        magic: String::from_utf8_lossy(&magic.raw().to_be_bytes()).into_owned(),
        format: if magic.is_block() { "block" } else { "data" },
        ops: format!("{ops:?}"),
        v3,
        bestfree,
        records,
        walk_error,
        trailer,
        verify,
    })
}

fn print_inspect(output: &InspectOutput) {
    println!(
        "block {}: {} ({} format, {})",
        output.block, output.magic, output.format, output.ops
    );
    if let Some(v3) = &output.v3 {
        println!(
            "  crc {:#010x}  blkno {}  lsn {:#x}  owner {:#x}",
            v3.crc, v3.blkno, v3.lsn, v3.owner
        );
        println!("  uuid {}", v3.uuid);
    }
    println!("  bestfree {:?}", output.bestfree);
    for record in &output.records {
        match record {
            RecordOutput::Entry {
                offset,
                ino,
                name,
                ftype,
                size,
            } => println!("  {offset:>6} entry  ino={ino:#x} name={name:?} ftype={ftype} size={size}"),
            RecordOutput::Unused { offset, length } => {
                println!("  {offset:>6} unused length={length}");
            }
        }
    }
    if let Some(err) = &output.walk_error {
        println!("  walk stopped: {err}");
    }
    if let Some(trailer) = &output.trailer {
        println!(
            "  trailer count={} stale={} leaves at {}",
            trailer.count, trailer.stale, trailer.leaf_offset
        );
    }
    println!("  verify {}", status_line(&output.verify));
}

fn status_line(status: &BlockStatus) -> String {
    match status {
        BlockStatus::Ok => "ok".to_owned(),
        BlockStatus::Corrupted { offset, detail } => format!("corrupted at offset {offset}: {detail}"),
        BlockStatus::BadCrc => "bad crc".to_owned(),
        BlockStatus::Error { detail } => format!("error: {detail}"),
    }
}

/// Verify directory blocks. Without `--blocks` only blocks that carry a
/// directory magic are checked; an explicit range checks every block in it.
fn verify(opts: &Options) -> Result<VerifyReport> {
    let mount = open(opts, "verify", true)?;
    let ctx = mount.ctx();
    let step = u64::from(ctx.geo.fsbcount);
    let count = mount.cache().device().block_count();
    let (range, explicit) = match &opts.blocks {
        Some(range) => (range.clone(), true),
        None => (0..count, false),
    };
    if range.end > count {
        bail!("block range {range:?} is beyond the end of the image ({count} blocks)");
    }

    let mut blocks = Vec::new();
    let mut daddr = range.start;
    while daddr + step <= range.end {
        let mut buf = read_dir_block(&mount, daddr)?;
        if explicit || DataMagic::read(buf.data()).is_ok() {
            let status = check(ctx, &mut buf);
            if status != BlockStatus::Ok {
                info!(block = daddr, ?status, "directory block failed verification");
            }
            blocks.push(BlockResult { block: daddr, status });
        }
        daddr += step;
    }

    let failed = blocks.iter().filter(|b| b.status != BlockStatus::Ok).count();
    Ok(VerifyReport {
        checked: blocks.len(),
        failed,
        blocks,
    })
}

fn print_verify(report: &VerifyReport) {
    for result in &report.blocks {
        println!("block {}: {}", result.block, status_line(&result.status));
    }
    println!("{} checked, {} failed", report.checked, report.failed);
}

/// Write a freshly initialised data block at `--block`, owned by `--owner`.
fn mkblock(opts: &Options) -> Result<MkblockOutput> {
    let block = opts.block("mkblock")?;
    let mount = open(opts, "mkblock", false)?;
    let ctx = mount.ctx();
    let geo = ctx.geo;
    if block + u64::from(geo.fsbcount) > mount.cache().device().block_count() {
        bail!("block {block} is beyond the end of the image");
    }

    let mut dp = DirInode::new(InodeNumber(opts.owner));
    dp.fork.insert(Extent {
        file_off: 0,
        start: BlockNumber(block),
        len: geo.fsbcount,
    })?;
    dp.size = u64::from(geo.blksize);

    let mut tp = ctx.journal.begin();
    {
        let mut args = DaArgs {
            ctx,
            cache: mount.cache(),
            alloc: mount.alloc(),
            tp: &mut tp,
            dp: &mut dp,
            ops: ctx.ops,
            ops_override: None,
        };
        data_init(&mut args, DirBlock(0)).context("failed to initialise data block")?;
    }
    let lsn = tp.commit(mount.cache()).context("failed to commit data block")?;
    mount.sync()?;
    info!(block, owner = opts.owner, lsn = lsn.0, "data block written");

    let magic = if ctx.ops.is_v3() { DataMagic::Dir3Data } else { DataMagic::Dir2Data };
    Ok(MkblockOutput {
        block,
        magic: String::from_utf8_lossy(&magic.raw().to_be_bytes()).into_owned(),
        owner: opts.owner,
        lsn: lsn.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn image(blocks: u64) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(4096 * blocks).unwrap();
        file
    }

    fn opts(args: &[&str]) -> Options {
        Options::parse("test", args.iter().map(|s| (*s).to_owned())).unwrap()
    }

    fn with_image(file: &NamedTempFile, args: &[&str]) -> Options {
        let mut all = vec![file.path().to_str().unwrap()];
        all.extend_from_slice(args);
        opts(&all)
    }

    fn crc_config() -> NamedTempFile {
        let config = MountConfig {
            crc: true,
            ..MountConfig::default()
        };
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(config.to_json_pretty().unwrap().as_bytes()).unwrap();
        file
    }

    #[test]
    fn option_parsing() {
        let parsed = opts(&["img", "--block", "0x10", "--owner", "128", "--json"]);
        assert_eq!(parsed.image.as_deref(), Some(Path::new("img")));
        assert_eq!(parsed.block, Some(16));
        assert_eq!(parsed.owner, 128);
        assert!(parsed.json);

        assert_eq!(parse_range("2..6").unwrap(), 2..6);
        assert!(parse_range("6..2").is_err());
        assert!(parse_range("6").is_err());
        assert!(Options::parse("x", ["--block".to_owned()]).is_err());
        assert!(Options::parse("x", ["--bogus".to_owned()]).is_err());
        assert!(Options::parse("x", ["a".to_owned(), "b".to_owned()]).is_err());
        assert!(opts(&[]).image("inspect").is_err());
        assert!(opts(&["img"]).block("inspect").is_err());
    }

    #[test]
    fn mkblock_then_inspect_and_verify() {
        let file = image(8);
        let made = mkblock(&with_image(&file, &["--block", "3", "--owner", "0x80"])).unwrap();
        assert_eq!(made.magic, "XD2D");
        assert_eq!(made.lsn, xd_types::Lsn::new(1, 1).0);

        let report = verify(&with_image(&file, &[])).unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.blocks[0].block, 3);

        let out = inspect(&with_image(&file, &["--block", "3"])).unwrap();
        assert_eq!(out.magic, "XD2D");
        assert_eq!(out.format, "data");
        assert!(out.v3.is_none());
        assert_eq!(out.bestfree, vec![(16, 4080), (0, 0), (0, 0)]);
        assert!(matches!(
            out.records.as_slice(),
            [RecordOutput::Unused {
                offset: 16,
                length: 4080
            }]
        ));
        assert!(out.walk_error.is_none());
        assert_eq!(out.verify, BlockStatus::Ok);

        // a zeroed block is not a directory block
        assert!(inspect(&with_image(&file, &["--block", "2"])).is_err());
        assert!(inspect(&with_image(&file, &["--block", "8"])).is_err());
    }

    #[test]
    fn crc_block_verifies_in_a_later_session() {
        let file = image(8);
        let config = crc_config();
        let config_path = config.path().to_str().unwrap();
        let made = mkblock(&with_image(
            &file,
            &["--block", "5", "--owner", "0x80", "--config", config_path],
        ))
        .unwrap();
        assert_eq!(made.magic, "XDD3");

        let out = inspect(&with_image(&file, &["--block", "5", "--config", config_path])).unwrap();
        let v3 = out.v3.as_ref().unwrap();
        assert_eq!(v3.blkno, 5);
        assert_eq!(v3.owner, 0x80);
        assert_eq!(v3.lsn, made.lsn);
        assert_eq!(out.bestfree[0], (64, 4032));
        assert_eq!(out.verify, BlockStatus::Ok);

        // flip one payload byte: the CRC no longer matches
        let mut raw = std::fs::read(file.path()).unwrap();
        raw[5 * 4096 + 1000] ^= 1;
        std::fs::write(file.path(), &raw).unwrap();
        let report = verify(&with_image(&file, &["--config", config_path])).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.blocks[0].status, BlockStatus::BadCrc);
    }

    #[test]
    fn verify_reports_the_damaged_tag() {
        let file = image(8);
        mkblock(&with_image(&file, &["--block", "1"])).unwrap();
        mkblock(&with_image(&file, &["--block", "4"])).unwrap();

        let mut raw = std::fs::read(file.path()).unwrap();
        raw[4 * 4096 + 4094] ^= 0xFF;
        std::fs::write(file.path(), &raw).unwrap();

        let report = verify(&with_image(&file, &[])).unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.blocks[0].status, BlockStatus::Ok);
        match &report.blocks[1].status {
            BlockStatus::Corrupted { offset, .. } => assert_eq!(*offset, 4094),
            other => panic!("expected corruption, got {other:?}"),
        }

        // an explicit range checks zeroed blocks too
        let report = verify(&with_image(&file, &["--blocks", "0..2"])).unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.failed, 1);
        assert!(verify(&with_image(&file, &["--blocks", "0..9"])).is_err());

        let path = file.path().to_str().unwrap().to_owned();
        let err = run(["verify".to_owned(), path].into_iter()).unwrap_err();
        assert!(err.to_string().contains("1 of 2"));
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(run(["frobnicate".to_owned()].into_iter()).is_err());
        assert!(run(std::iter::empty()).is_ok());
    }
}
