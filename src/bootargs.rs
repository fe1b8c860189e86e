//! Kernel command line (`bootargs`) editing.

use log::{info, warn};

use crate::config::BoardConfig;
use crate::constants::*;
use crate::env::Environment;

/// One `param[=value]` token. Quotes around the value (or around the
/// whole token) are stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg<'a> {
    pub param: &'a str,
    pub value: Option<&'a str>,
}

/// Split a command line into parameters, honouring double quotes
pub fn parse_args(cmdline: &str) -> Vec<Arg<'_>> {
    let mut args = Vec::new();
    let mut rest = cmdline.trim_start();
    while !rest.is_empty() {
        let (arg, next) = next_arg(rest);
        args.push(arg);
        rest = next.trim_start();
    }
    args
}

/// Parse the first argument of `args` (which starts at a non-space)
/// and return it with the remainder of the line.
pub fn next_arg(args: &str) -> (Arg<'_>, &str) {
    let bytes = args.as_bytes();
    let mut in_quote = false;
    let mut equals = None;
    let mut end = bytes.len();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b' ' && !in_quote {
            end = i;
            break;
        }
        if equals.is_none() && b == b'=' {
            equals = Some(i);
        }
        if b == b'"' {
            in_quote = !in_quote;
        }
    }
    let token = &args[..end];
    let rest = &args[end..];
    let arg = match equals {
        Some(eq) => Arg { param: unquote(&token[..eq]), value: Some(unquote(&token[eq + 1..])) },
        None => Arg { param: unquote(token), value: None },
    };
    (arg, rest)
}

fn unquote(s: &str) -> &str {
    let s = s.strip_prefix('"').unwrap_or(s);
    s.strip_suffix('"').unwrap_or(s)
}

fn format_arg(arg: &Arg) -> String {
    match arg.value {
        Some(v) if v.contains(' ') => format!("{}=\"{}\"", arg.param, v),
        Some(v) => format!("{}={}", arg.param, v),
        None => arg.param.to_string(),
    }
}

/// `androidboot.dtbo_idx=i,j,k`, or None for an empty list
pub fn assemble_dtbo_idx_string(indices: &[u32]) -> Option<String> {
    if indices.is_empty() {
        return None;
    }
    let list: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
    Some(format!("{}={}", DTBO_IDX_PARAM, list.join(",")))
}

/// Put the mandatory overlay indices in front of the user supplied ones
/// and write the result back to `bootargs`.
pub fn add_dtbo_index(env: &mut Environment, indices: &[u32]) {
    let Some(mandatory) = assemble_dtbo_idx_string(indices) else {
        return;
    };
    let Some(bootargs) = env.get("bootargs").map(str::to_string) else {
        env.set("bootargs", &mandatory);
        return;
    };

    let mut kept = Vec::new();
    let mut user_values = None;
    for arg in parse_args(&bootargs) {
        if arg.param == DTBO_IDX_PARAM {
            user_values = arg.value;
        } else {
            kept.push(format_arg(&arg));
        }
    }
    let dtbo = match user_values {
        Some(v) if !v.is_empty() => format!("{},{}", mandatory, v),
        _ => mandatory,
    };
    kept.push(dtbo);
    let new_bootargs = kept.join(" ");
    if new_bootargs.len() >= KERNEL_CMDLINE_SIZE {
        warn!("bootargs longer than {} bytes", KERNEL_CMDLINE_SIZE);
    }
    env.set("bootargs", &new_bootargs);
}

/// Prepend `arg` to `bootargs`
pub fn prepend_arg(env: &mut Environment, arg: &str) {
    let new_bootargs = match env.get("bootargs") {
        Some(old) if !old.is_empty() => format!("{} {}", arg, old),
        _ => arg.to_string(),
    };
    env.set("bootargs", &new_bootargs);
}

/// Append `arg` to `bootargs`
pub fn append_arg(env: &mut Environment, arg: &str) {
    if arg.is_empty() {
        return;
    }
    let new_bootargs = match env.get("bootargs") {
        Some(old) if !old.is_empty() => format!("{} {}", old, arg),
        _ => arg.to_string(),
    };
    env.set("bootargs", &new_bootargs);
}

pub fn set_board_id_args(env: &mut Environment, plat_id: u32) {
    prepend_arg(env, &format!("androidboot.board_id={:#x}", plat_id));
}

pub fn set_cpu_revision_args(env: &mut Environment, board: &BoardConfig) {
    let (integer, fraction) = board.cpu_revision();
    prepend_arg(env, &format!("androidboot.revision={}.{}", integer, fraction));
}

/// Expose the bootloader boot partitions to the kernel, only while the
/// IPL is unlocked
pub fn set_blkdevparts_args(env: &mut Environment, board: &BoardConfig) {
    if board.ipl_locked {
        return;
    }
    let size = board.bootloader_size;
    prepend_arg(
        env,
        &format!("blkdevparts=mmcblk0boot0:{}(bootloader_a);mmcblk0boot1:{}(bootloader_b)", size, size),
    );
}

pub fn set_fakertc_args(env: &mut Environment) {
    let rtc_time = env.get_ulong("rtc_time", 10, RTC_TIME_SEC) as u32;
    prepend_arg(env, &format!("init_time={}", rtc_time));
}

pub fn set_bootreason_args(env: &mut Environment, reason: &str) {
    let arg = format!("androidboot.bootreason={}", reason);
    info!("Bootreason: {}", arg);
    prepend_arg(env, &arg);
}

/// Value of the first `param=` in the command line
pub fn find_arg<'a>(cmdline: &'a str, param: &str) -> Option<&'a str> {
    parse_args(cmdline).into_iter().find(|a| a.param == param).and_then(|a| a.value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with(bootargs: &str) -> Environment {
        [("bootargs", bootargs)].into_iter().collect()
    }

    #[test]
    fn parses_quoted_values() {
        let args = parse_args(r#"console=ttySC0 quiet  foo="a b" "x=y z""#);
        assert_eq!(args.len(), 4);
        assert_eq!(args[1], Arg { param: "quiet", value: None });
        assert_eq!(args[2], Arg { param: "foo", value: Some("a b") });
        assert_eq!(args[3], Arg { param: "x", value: Some("y z") });
    }

    #[test]
    fn dtbo_indices_are_prepended_to_user_list() {
        let mut env = env_with(r#"console=ttySC0 androidboot.dtbo_idx=1,3 foo="a b""#);
        add_dtbo_index(&mut env, &[4, 5, 6]);
        assert_eq!(env.get("bootargs"), Some(r#"console=ttySC0 foo="a b" androidboot.dtbo_idx=4,5,6,1,3"#));
    }

    #[test]
    fn dtbo_indices_without_user_list() {
        let mut env = env_with("console=ttySC0");
        add_dtbo_index(&mut env, &[6]);
        assert_eq!(env.get("bootargs"), Some("console=ttySC0 androidboot.dtbo_idx=6"));
        let mut env = Environment::new();
        add_dtbo_index(&mut env, &[0, 2, 6]);
        assert_eq!(env.get("bootargs"), Some("androidboot.dtbo_idx=0,2,6"));
        add_dtbo_index(&mut env, &[]);
        assert_eq!(env.get("bootargs"), Some("androidboot.dtbo_idx=0,2,6"));
    }

    #[test]
    fn injected_args_are_prepended() {
        let mut env = env_with("console=ttySC0");
        let mut board = BoardConfig::default();
        set_board_id_args(&mut env, 0x0b77_9530);
        set_cpu_revision_args(&mut env, &board);
        set_blkdevparts_args(&mut env, &board);
        set_fakertc_args(&mut env);
        assert_eq!(
            env.get("bootargs"),
            Some("init_time=1563524000 androidboot.revision=3.0 androidboot.board_id=0xb779530 console=ttySC0")
        );
        board.ipl_locked = false;
        board.bootloader_size = 4096;
        let mut env = Environment::new();
        env.set("rtc_time", "42");
        set_blkdevparts_args(&mut env, &board);
        set_fakertc_args(&mut env);
        assert_eq!(
            env.get("bootargs"),
            Some("init_time=42 blkdevparts=mmcblk0boot0:4096(bootloader_a);mmcblk0boot1:4096(bootloader_b)")
        );
    }

    #[test]
    fn find_arg_value() {
        assert_eq!(find_arg("a=1 androidboot.dtbo_idx=2,3", DTBO_IDX_PARAM), Some("2,3"));
        assert_eq!(find_arg("a=1", DTBO_IDX_PARAM), None);
    }
}
