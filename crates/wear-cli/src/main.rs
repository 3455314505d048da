#![forbid(unsafe_code)]

// Native-only runner. Keep a stub `main` so `--workspace` builds for wasm32 still succeed.
#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use anyhow::{bail, Context, Result};
    use clap::Parser;
    use tracing_subscriber::EnvFilter;
    use wear_core::{EmuState, Emulator, EmulatorConfig, FlatBinaryLoader};
    use wear_gpu::{RenderCommand, RenderQueue};
    use wear_mem::regions::USER_BASE;

    const PRESENT_WAIT: Duration = Duration::from_millis(16);
    const STATE_POLL: Duration = Duration::from_millis(5);

    #[derive(Debug, Parser)]
    #[command(name = "wear", about = "Headless runner for the WeaR console core")]
    pub struct Args {
        /// Boot the built-in BIOS program (the default when no `--binary` is given).
        #[arg(long, conflicts_with = "binary")]
        bios: bool,

        /// Flat binary to load instead of the BIOS.
        #[arg(long)]
        binary: Option<PathBuf>,

        /// Guest address the binary is copied to; also its entry point. Defaults to the user
        /// base, 0x400000.
        #[arg(long, value_parser = parse_u64, requires = "binary")]
        load_address: Option<u64>,

        /// JSON emulator configuration. Flags below override its fields.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Guest memory size in MiB (power of two).
        #[arg(long)]
        memory_mib: Option<u64>,

        /// Nesting limit for PM4 indirect buffers.
        #[arg(long)]
        max_indirect_depth: Option<u32>,

        /// Instructions executed between controller state checks.
        #[arg(long)]
        steps_per_tick: Option<u64>,

        /// Stop after N milliseconds of host time, or earlier if the guest halts.
        #[arg(long, default_value_t = 1000)]
        run_ms: u64,

        /// Log filter used when `RUST_LOG` is unset.
        #[arg(long, default_value = "info")]
        log_level: String,

        /// Print the final statistics as JSON instead of text.
        #[arg(long)]
        stats_json: bool,
    }

    fn parse_u64(s: &str) -> Result<u64, String> {
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
            None => s.replace('_', "").parse(),
        };
        parsed.map_err(|err| format!("invalid address {s:?}: {err}"))
    }

    fn build_config(args: &Args) -> Result<EmulatorConfig> {
        let mut config = match &args.config {
            Some(path) => EmulatorConfig::from_json_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => EmulatorConfig::default(),
        };
        if let Some(mib) = args.memory_mib {
            config.memory.size_bytes = mib
                .checked_mul(1024 * 1024)
                .context("memory size overflow")?;
        }
        if let Some(depth) = args.max_indirect_depth {
            config.decoder.max_indirect_depth = depth;
        }
        if let Some(steps) = args.steps_per_tick {
            config.steps_per_tick = steps;
        }
        Ok(config)
    }

    #[derive(Debug, Default)]
    struct Presented {
        commands: u64,
        clears: u64,
        draws: u64,
        dispatches: u64,
        frames: u64,
    }

    impl Presented {
        fn record(&mut self, cmd: RenderCommand) {
            self.commands += 1;
            match cmd {
                RenderCommand::Clear { .. } => self.clears += 1,
                RenderCommand::Draw { .. } | RenderCommand::DrawIndexed { .. } => self.draws += 1,
                RenderCommand::Dispatch { .. } => self.dispatches += 1,
                RenderCommand::EndFrame => {
                    self.frames += 1;
                    tracing::debug!(frame = self.frames, "frame presented");
                }
            }
        }
    }

    /// Drains the render queue until `done` is set. Stands in for a real renderer.
    fn present(queue: Arc<RenderQueue>, done: Arc<AtomicBool>) -> Presented {
        let mut presented = Presented::default();
        loop {
            let finished = done.load(Ordering::Acquire);
            if queue.wait_for_commands(PRESENT_WAIT) {
                for cmd in queue.pop_all() {
                    presented.record(cmd);
                }
            }
            if finished {
                return presented;
            }
        }
    }

    pub fn main() -> Result<()> {
        let args = Args::parse();

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();

        let config = build_config(&args)?;
        let mut emu = Emulator::new(config);
        emu.initialize().context("failed to initialize emulator")?;

        match &args.binary {
            Some(path) if !args.bios => {
                let load_address = args.load_address.unwrap_or(USER_BASE);
                emu.load_program(&FlatBinaryLoader::new(path, load_address))
                    .with_context(|| format!("failed to load {}", path.display()))?;
            }
            _ => {
                emu.load_internal_bios()
                    .context("failed to load internal BIOS")?;
            }
        }

        let done = Arc::new(AtomicBool::new(false));
        let presenter = {
            let (queue, done) = (emu.render_queue(), Arc::clone(&done));
            thread::Builder::new()
                .name("wear-present".to_owned())
                .spawn(move || present(queue, done))
                .context("failed to spawn presentation thread")?
        };

        if !emu.run() {
            bail!("emulator refused to run (state {})", emu.state());
        }
        let deadline = Instant::now() + Duration::from_millis(args.run_ms);
        while Instant::now() < deadline && emu.state() == EmuState::Running {
            thread::sleep(STATE_POLL);
        }

        // Freeze the guest and drain everything it queued before stopping; stopping clears the
        // queue and resets the CPU.
        let final_state = emu.state();
        if final_state == EmuState::Running {
            emu.pause();
        }
        done.store(true, Ordering::Release);
        let mut presented = match presenter.join() {
            Ok(presented) => presented,
            Err(_) => bail!("presentation thread panicked"),
        };
        for cmd in emu.render_queue().pop_all() {
            presented.record(cmd);
        }
        let stats = emu.stats();
        let rip = emu.cpu_snapshot().rip;
        if matches!(final_state, EmuState::Running | EmuState::Paused) {
            emu.stop();
        }
        emu.shutdown();

        if args.stats_json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            println!("state:               {final_state}");
            println!("rip:                 {rip:#018x}");
            println!("instructions:        {}", stats.instructions);
            println!(
                "syscalls:            {} ({} unimplemented)",
                stats.syscalls, stats.unimplemented_syscalls
            );
            println!("pm4 packets:         {}", stats.packets_processed);
            println!(
                "queued draws:        {} ({} dispatches)",
                stats.draw_calls, stats.dispatches
            );
            println!("frames:              {}", stats.frames);
            println!(
                "presented commands:  {} ({} clears, {} draws, {} dispatches, {} frames)",
                presented.commands,
                presented.clears,
                presented.draws,
                presented.dispatches,
                presented.frames
            );
        }

        if final_state == EmuState::Error {
            bail!("guest stopped in the error state at rip {rip:#x}");
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn addresses_accept_hex_and_decimal() {
            assert_eq!(parse_u64("0x400000"), Ok(0x40_0000));
            assert_eq!(parse_u64("0x40_0000"), Ok(0x40_0000));
            assert_eq!(parse_u64("4096"), Ok(4096));
            assert!(parse_u64("0xZZ").is_err());
        }

        #[test]
        fn flags_override_config() {
            let args = Args::parse_from([
                "wear",
                "--memory-mib",
                "16",
                "--max-indirect-depth",
                "2",
            ]);
            let config = build_config(&args).unwrap();
            assert_eq!(config.memory.size_bytes, 16 << 20);
            assert_eq!(config.decoder.max_indirect_depth, 2);
            assert!(!args.bios);
        }

        #[test]
        fn presented_commands_are_tallied_by_kind() {
            let mut presented = Presented::default();
            for cmd in [
                RenderCommand::CLEAR_BLACK,
                RenderCommand::Draw {
                    vertex_count: 3,
                    instance_count: 1,
                    primitive_type: 4,
                },
                RenderCommand::Dispatch {
                    groups_x: 1,
                    groups_y: 1,
                    groups_z: 1,
                },
                RenderCommand::EndFrame,
            ] {
                presented.record(cmd);
            }
            assert_eq!(presented.commands, 4);
            assert_eq!(
                (presented.clears, presented.draws, presented.dispatches, presented.frames),
                (1, 1, 1, 1)
            );
        }

        #[test]
        fn bios_and_binary_conflict() {
            assert!(Args::try_parse_from(["wear", "--bios", "--binary", "x.bin"]).is_err());
            assert!(Args::try_parse_from(["wear", "--load-address", "0x1000"]).is_err());
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn main() -> anyhow::Result<()> {
    native::main()
}
