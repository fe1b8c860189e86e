use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use argh::FromArgs;
use log::{error, info};
use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices, Termios};

use librcar_boota_r::avb_ops::DiskAvbOps;
use librcar_boota_r::boot_android::StagedBoot;
use librcar_boota_r::config::Config;
use librcar_boota_r::gpt_helper::MmcDisk;
use librcar_boota_r::ops::Console;
use librcar_boota_r::sysmem::SysMem;
use librcar_boota_r::{do_boota, do_dtboinfo, do_slot_action, list_slots, parse_boota_args, CmdRet, SlotAction};

#[derive(FromArgs)]
/// R-Car Gen3 Android boot flow on a disk image:
/// A/B slot selection, DTB overlays and boot image staging
struct CmdProg {
    /// GPT disk image standing in for the eMMC
    #[argh(option, short = 'd', default = "String::from(\"mmc1.img\")")]
    disk: String,
    /// board configuration (TOML), a template is written if it does not exist
    #[argh(option, short = 'c')]
    config: Option<String>,
    /// boot image to place in memory for `boota <dev> RAM <addr>`
    #[argh(option)]
    ram_image: Option<String>,
    /// directory to dump the staged kernel, ramdisk, dtb and bootargs into
    #[argh(option, short = 'o')]
    out: Option<String>,
    #[argh(subcommand)]
    /// subcommand
    mode: Mode,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Mode {
    Boota(BootaMode),
    DtboInfo(DtboInfoMode),
    List(ListMode),
    Switch(SwitchMode),
    MarkSuccessful(MarkSuccessfulMode),
    MarkUnbootable(MarkUnbootableMode),
}

#[derive(FromArgs)]
#[argh(
    subcommand,
    name = "boota",
    example = "boota boota 1 48080000",
    example = "boota --ram-image boot.img boota 1 RAM 58000000"
)]
/// boot Android image from mmc: <mmc_dev> [mmc_part] <boot_addr> [avb]
struct BootaMode {
    /// mmc_dev, optional mmc_part (RAM for a staged image), boot_addr
    #[argh(positional)]
    args: Vec<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "dtboinfo")]
/// prints information about dtbo partition
struct DtboInfoMode {
    /// slot, a or b (default a)
    #[argh(positional)]
    slot: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "list")]
/// show A/B metadata
struct ListMode {}

#[derive(FromArgs)]
#[argh(subcommand, name = "switch")]
/// make a slot active for the next boot
struct SwitchMode {
    /// slot, a or b
    #[argh(positional)]
    slot: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "mark-successful")]
/// mark a slot as successfully booted
struct MarkSuccessfulMode {
    /// slot, a or b
    #[argh(positional)]
    slot: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "mark-unbootable")]
/// mark a slot as unbootable
struct MarkUnbootableMode {
    /// slot, a or b
    #[argh(positional)]
    slot: String,
}

/// stdin in non-canonical mode, so a single key press is seen without Enter
struct TermConsole {
    saved: Option<Termios>,
    pending: Option<u8>,
}

impl TermConsole {
    fn new() -> Self {
        let stdin = std::io::stdin();
        let saved = termios::tcgetattr(&stdin).ok();
        if let Some(orig) = &saved {
            let mut raw = orig.clone();
            raw.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
            raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
            raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
            if termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw).is_err() {
                return TermConsole { saved: None, pending: None };
            }
        }
        TermConsole { saved, pending: None }
    }
}

impl Drop for TermConsole {
    fn drop(&mut self) {
        if let Some(orig) = &self.saved {
            let _ = termios::tcsetattr(std::io::stdin(), SetArg::TCSANOW, orig);
        }
    }
}

impl Console for TermConsole {
    fn tstc(&mut self) -> bool {
        if self.pending.is_some() {
            return true;
        }
        // not a terminal: nobody can press a key
        if self.saved.is_none() {
            return false;
        }
        let mut b = [0u8; 1];
        if let Ok(1) = std::io::stdin().lock().read(&mut b) {
            self.pending = Some(b[0]);
        }
        self.pending.is_some()
    }

    fn getc(&mut self) -> Option<u8> {
        self.pending.take()
    }

    fn mdelay(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

fn load_config(path: &Option<String>) -> Option<Config> {
    let Some(path) = path else {
        return Some(Config::default());
    };
    if !Path::new(path).exists() {
        info!("{} not found, writing a template", path);
        if let Err(e) = fs::write(path, Config::template()) {
            error!("write {} failed: {}", path, e);
        }
        return Some(Config::default());
    }
    match Config::from_file(path) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!("{}", e);
            None
        }
    }
}

fn dump_staged(out: &str, mem: &SysMem, staged: &StagedBoot, bootargs: &str) -> std::io::Result<()> {
    let dir = PathBuf::from(out);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("kernel"), mem.read(staged.kernel_addr, staged.kernel_size as usize))?;
    fs::write(dir.join("ramdisk"), mem.read(staged.ramdisk_addr, staged.ramdisk_size as usize))?;
    fs::write(dir.join("board.dtb"), mem.read(staged.dtb_addr, staged.dtb_size as usize))?;
    fs::write(dir.join("bootargs"), bootargs)?;
    info!("staged images written to {}", dir.display());
    Ok(())
}

fn run(args: CmdProg) -> CmdRet {
    let Some(config) = load_config(&args.config) else {
        return CmdRet::Failure;
    };
    let disk = match MmcDisk::open(&args.disk, config.board.mmc_block_size) {
        Ok(disk) => disk,
        Err(e) => {
            error!("open {} failed: {}", args.disk, e);
            return CmdRet::Failure;
        }
    };
    let mut ops = DiskAvbOps::new(disk, &config.avb);

    match args.mode {
        Mode::Boota(boota) => {
            let argv: Vec<&str> = boota.args.iter().map(String::as_str).collect();
            let mut mem = SysMem::new();
            if let Some(image) = &args.ram_image {
                let addr = match parse_boota_args(&argv) {
                    Ok(parsed) => parsed.addr,
                    Err(ret) => return ret,
                };
                match fs::read(image) {
                    Ok(data) => mem.write(addr, &data),
                    Err(e) => {
                        error!("read {} failed: {}", image, e);
                        return CmdRet::Failure;
                    }
                }
            }
            let mut env = config.environment();
            let mut console = TermConsole::new();
            let staged = match do_boota(&mut ops, &mut console, &mut mem, &mut env, &config, &argv) {
                Ok(staged) => staged,
                Err(ret) => return ret,
            };
            let bootargs = env.get("bootargs").unwrap_or("").to_string();
            println!("bootargs: {}", bootargs);
            println!("{}", staged.booti_args());
            if let Some(out) = &args.out {
                if let Err(e) = dump_staged(out, &mem, &staged, &bootargs) {
                    error!("dump to {} failed: {}", out, e);
                    return CmdRet::Failure;
                }
            }
            CmdRet::Success
        }
        Mode::DtboInfo(info) => do_dtboinfo(ops.disk(), info.slot.as_deref()),
        Mode::List(_) => list_slots(&mut ops),
        Mode::Switch(s) => do_slot_action(&mut ops, SlotAction::Activate, &s.slot),
        Mode::MarkSuccessful(s) => do_slot_action(&mut ops, SlotAction::MarkSuccessful, &s.slot),
        Mode::MarkUnbootable(s) => do_slot_action(&mut ops, SlotAction::MarkUnbootable, &s.slot),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: CmdProg = argh::from_env();
    let ret = run(args);
    if ret == CmdRet::Usage {
        eprintln!("wrong arguments, see --help");
    }
    std::process::exit(ret.code());
}
