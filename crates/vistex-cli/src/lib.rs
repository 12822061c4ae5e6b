//! # Vistex CLI
//!
//! Command-line tools for the Vistex virtual texture streamer.
//!
//! ## Commands
//! - `simulate` - Run the streaming loop headless against a panning camera
//! - `address` - Compute the indirection id of a page
//! - `layout` - Show the indirection layout of a texture
//! - `config` - Print the effective streaming configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glam::UVec2;
use parking_lot::Mutex;
use vistex_core::{
    indirection_count, indirection_id, mip_count, AtlasFormat, FeedbackInfo, StreamingConfig,
    SAMPLES_PER_BLOCK,
};
use vistex_renderer::{HeadlessDevice, UploadOutcome, VirtualTextureManager};

/// Vistex virtual texture streaming tools
#[derive(Parser)]
#[command(name = "vistex")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Streaming configuration file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream a large texture under a panning camera on a headless device
    Simulate {
        /// Number of frames
        #[arg(short, long, default_value = "120")]
        frames: u32,

        /// Render width in pixels
        #[arg(long, default_value = "1280")]
        width: u32,

        /// Render height in pixels
        #[arg(long, default_value = "720")]
        height: u32,

        /// Virtual texture side in texels
        #[arg(long, default_value = "16384")]
        texture_size: u32,

        /// Atlas side in slots
        #[arg(long, default_value = "8")]
        atlas_pages: u32,

        /// Camera speed in texels per frame
        #[arg(long, default_value = "48")]
        speed: u32,
    },

    /// Compute the indirection id of a page
    Address {
        #[arg(long)]
        slice_x: u32,

        #[arg(long)]
        slice_y: u32,

        #[arg(long, default_value = "0")]
        mip: u32,

        /// Mip 0 pages per row
        #[arg(long)]
        count_x: u32,

        /// Mip 0 pages per column
        #[arg(long)]
        count_y: u32,
    },

    /// Show the indirection entries of each mip of a texture
    Layout {
        /// Texture width in texels
        #[arg(long)]
        width: u32,

        /// Texture height in texels
        #[arg(long)]
        height: u32,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the streaming configuration
    Config,
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let config = load_config(cli.config.as_deref())?;
    let output = run(&cli.command, &config)?;
    println!("{output}");
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<StreamingConfig> {
    match path {
        Some(path) => StreamingConfig::from_json_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(StreamingConfig::default()),
    }
}

/// Run a command and return what it prints
pub fn run(command: &Commands, config: &StreamingConfig) -> Result<String> {
    match *command {
        Commands::Simulate {
            frames,
            width,
            height,
            texture_size,
            atlas_pages,
            speed,
        } => {
            let scenario = Scenario {
                frames,
                extent: UVec2::new(width, height),
                texture_size,
                atlas_pages,
                speed,
            };
            let report = simulate(config, &scenario)?;
            Ok(report.to_string())
        }

        Commands::Address {
            slice_x,
            slice_y,
            mip,
            count_x,
            count_y,
        } => {
            let id = indirection_id(slice_x, slice_y, count_x, count_y, mip)
                .context("indirection id does not fit in 32 bits")?;
            Ok(id.to_string())
        }

        Commands::Layout { width, height, json } => {
            let levels = texture_layout(width, height, config.page_size)
                .context("texture layout does not fit in 32-bit indirection ids")?;
            if json {
                let value = serde_json::json!({
                    "width": width,
                    "height": height,
                    "page_size": config.page_size,
                    "indirection_count": indirection_count(width, height, config.page_size),
                    "mips": levels
                        .iter()
                        .map(|level| serde_json::json!({
                            "mip": level.mip,
                            "pages_x": level.pages.x,
                            "pages_y": level.pages.y,
                            "first_entry": level.first_entry,
                        }))
                        .collect::<Vec<_>>(),
                });
                return Ok(serde_json::to_string_pretty(&value)?);
            }

            let mut lines: Vec<String> = levels
                .iter()
                .map(|level| {
                    format!(
                        "mip {:2}: {}x{} pages, entries {}..{}",
                        level.mip,
                        level.pages.x,
                        level.pages.y,
                        level.first_entry,
                        level.first_entry + level.pages.x * level.pages.y
                    )
                })
                .collect();
            lines.push(format!(
                "total: {} entries",
                indirection_count(width, height, config.page_size)
            ));
            Ok(lines.join("\n"))
        }

        Commands::Config => Ok(config.to_json_string()?),
    }
}

/// Indirection layout of one mip level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MipLayout {
    pub mip: u32,
    pub pages: UVec2,
    pub first_entry: u32,
}

/// Per-mip page grids and where each starts in the texture's indirection region
pub fn texture_layout(width: u32, height: u32, page_size: u32) -> Option<Vec<MipLayout>> {
    let page_size = page_size.max(1);
    let count_x = (width / page_size).max(1);
    let count_y = (height / page_size).max(1);

    (0..mip_count(width, height))
        .map(|mip| {
            Some(MipLayout {
                mip,
                pages: UVec2::new(
                    ((width >> mip) / page_size).max(1),
                    ((height >> mip) / page_size).max(1),
                ),
                first_entry: indirection_id(0, 0, count_x, count_y, mip)?,
            })
        })
        .collect()
}

/// Parameters of a headless streaming run
#[derive(Debug, Clone)]
pub struct Scenario {
    pub frames: u32,
    pub extent: UVec2,
    pub texture_size: u32,
    pub atlas_pages: u32,
    pub speed: u32,
}

/// Outcome of a headless streaming run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationReport {
    pub frames: u32,
    pub feedback_samples: u64,
    pub uploads: u32,
    pub rejections: u32,
    pub evictions: u32,
    pub discarded: u32,
    pub bytes_uploaded: u64,
    pub resident_pages: u32,
    pub pending_pages: usize,
}

impl std::fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "frames:           {}", self.frames)?;
        writeln!(f, "feedback samples: {}", self.feedback_samples)?;
        writeln!(f, "uploads:          {}", self.uploads)?;
        writeln!(f, "rejections:       {}", self.rejections)?;
        writeln!(f, "evictions:        {}", self.evictions)?;
        writeln!(f, "discarded:        {}", self.discarded)?;
        writeln!(f, "bytes uploaded:   {}", self.bytes_uploaded)?;
        writeln!(f, "resident pages:   {}", self.resident_pages)?;
        write!(f, "pending pages:    {}", self.pending_pages)
    }
}

const TEXTURE_ID: u16 = 0;

/// Feedback a shader would write for a camera looking at the texture at mip
/// 0, offset horizontally by `pan` texels. Each block samples its own page
/// and the next mip, as trilinear filtering would.
fn camera_feedback(counts: UVec2, block_size: u32, page_size: u32, pages: u32, pan: u32) -> Vec<u32> {
    let mut samples = Vec::with_capacity((counts.x * counts.y) as usize * SAMPLES_PER_BLOCK);
    for by in 0..counts.y {
        for bx in 0..counts.x {
            let texel_x = bx * block_size + pan;
            let texel_y = by * block_size;
            let slice_x = (texel_x / page_size) % pages;
            let slice_y = (texel_y / page_size) % pages;

            let fine = FeedbackInfo::new(TEXTURE_ID, 0, slice_x as u8, slice_y as u8);
            let coarse = FeedbackInfo::new(TEXTURE_ID, 1, (slice_x / 2) as u8, (slice_y / 2) as u8);
            samples.extend([fine.raw(), coarse.raw(), FeedbackInfo::UNUSED.raw()]);
        }
    }
    samples
}

/// Drive the streaming loop on a headless device
pub fn simulate(config: &StreamingConfig, scenario: &Scenario) -> Result<SimulationReport> {
    let pages = (scenario.texture_size / config.page_size.max(1)).clamp(1, 256);
    let texture_size = pages * config.page_size;

    let device = Arc::new(Mutex::new(HeadlessDevice::new()));
    let mut manager = VirtualTextureManager::new(config.clone(), scenario.extent, device.clone())?;

    let format = AtlasFormat::Bc1RgbaUnormSrgb;
    let atlas = manager.create_atlas(scenario.atlas_pages, scenario.atlas_pages, format)?;
    let offset = manager.create_new_indirection(indirection_count(texture_size, texture_size, config.page_size))?;
    let max_mip = mip_count(texture_size, texture_size) - 1;

    let slot_size = config.page_size_with_borders();
    let pixels = vec![0u8; format.bytes_for_extent(slot_size, slot_size) as usize];
    let mut requests = Vec::new();
    let mut report = SimulationReport::default();

    log::info!(
        "Simulating {} frames at {}x{}: {texture_size}x{texture_size} texture, {}x{} atlas",
        scenario.frames,
        scenario.extent.x,
        scenario.extent.y,
        scenario.atlas_pages,
        scenario.atlas_pages
    );

    for frame in 0..scenario.frames {
        manager.update_before_frame()?;

        requests.clear();
        manager.get_requested_slices(&mut requests, config.max_requests_per_frame as usize);
        for &page in &requests {
            if page.texture_id() != TEXTURE_ID || page.mip_level() as u32 > max_mip {
                manager.discard_request(page)?;
                report.discarded += 1;
                continue;
            }

            let outcome = manager.upload_data(
                atlas,
                &pixels,
                UVec2::splat(slot_size),
                page.slice_x() as u32,
                page.slice_y() as u32,
                page.mip_level() as u32,
                pages,
                pages,
                offset,
                page,
            )?;
            if outcome == UploadOutcome::Rejected {
                break;
            }
        }

        let samples = camera_feedback(
            manager.feedback_block_counts(),
            config.feedback_block_size,
            config.page_size,
            pages,
            frame * scenario.speed,
        );
        {
            let mut device = device.lock();
            device.write_buffer_u32(manager.feedback_buffer(), 0, &samples)?;
            device.submit_frame();
        }

        let stats = manager.stats();
        log::debug!(
            "frame {}: {} distinct, {} queued, {} uploads, {} evictions, {} pending",
            manager.frame_number(),
            stats.distinct_pages,
            stats.requests_queued,
            stats.uploads,
            stats.evictions,
            manager.pending_count()
        );
    }

    let total = manager.total_stats();
    report.frames = scenario.frames;
    report.feedback_samples = total.feedback_samples;
    report.uploads = total.uploads;
    report.rejections = total.rejections;
    report.evictions = total.evictions;
    report.bytes_uploaded = total.bytes_uploaded;
    report.resident_pages = total.uploads - total.evictions;
    report.pending_pages = manager.pending_count();
    Ok(report)
}
