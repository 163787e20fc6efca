//! パス引数を持つシステムコールの判別
//!
//! システムコール番号はアーキテクチャごとに異なるため、ビルド対象の `libc::SYS_*` 定数から
//! テーブルを構築します。テーブルにないシステムコールは判別対象外で、これは通常の経路です。

use deptrace_target::SyscallRegisters;
use nix::libc;

/// パス引数を持つシステムコールの定義
struct PathSyscall {
    number: libc::c_long,
    name: &'static str,
    path_argument: usize,
}

impl PathSyscall {
    const fn new(number: libc::c_long, name: &'static str, path_argument: usize) -> Self {
        Self {
            number,
            name,
            path_argument,
        }
    }
}

#[cfg(target_arch = "x86_64")]
const PATH_SYSCALLS: &[PathSyscall] = &[
    PathSyscall::new(libc::SYS_open, "open", 0),
    PathSyscall::new(libc::SYS_stat, "stat", 0),
    PathSyscall::new(libc::SYS_lstat, "lstat", 0),
    PathSyscall::new(libc::SYS_access, "access", 0),
    PathSyscall::new(libc::SYS_readlink, "readlink", 0),
    PathSyscall::new(libc::SYS_execve, "execve", 0),
    PathSyscall::new(libc::SYS_openat, "openat", 1),
    PathSyscall::new(libc::SYS_newfstatat, "newfstatat", 1),
    PathSyscall::new(libc::SYS_statx, "statx", 1),
    PathSyscall::new(libc::SYS_faccessat, "faccessat", 1),
    PathSyscall::new(libc::SYS_readlinkat, "readlinkat", 1),
    PathSyscall::new(libc::SYS_execveat, "execveat", 1),
    PathSyscall::new(libc::SYS_name_to_handle_at, "name_to_handle_at", 1),
];

#[cfg(target_arch = "x86")]
const PATH_SYSCALLS: &[PathSyscall] = &[
    PathSyscall::new(libc::SYS_open, "open", 0),
    PathSyscall::new(libc::SYS_stat, "stat", 0),
    PathSyscall::new(libc::SYS_lstat, "lstat", 0),
    PathSyscall::new(libc::SYS_stat64, "stat64", 0),
    PathSyscall::new(libc::SYS_lstat64, "lstat64", 0),
    PathSyscall::new(libc::SYS_access, "access", 0),
    PathSyscall::new(libc::SYS_readlink, "readlink", 0),
    PathSyscall::new(libc::SYS_execve, "execve", 0),
    PathSyscall::new(libc::SYS_openat, "openat", 1),
    PathSyscall::new(libc::SYS_fstatat64, "fstatat64", 1),
    PathSyscall::new(libc::SYS_statx, "statx", 1),
    PathSyscall::new(libc::SYS_faccessat, "faccessat", 1),
    PathSyscall::new(libc::SYS_readlinkat, "readlinkat", 1),
    PathSyscall::new(libc::SYS_execveat, "execveat", 1),
    PathSyscall::new(libc::SYS_name_to_handle_at, "name_to_handle_at", 1),
];

// aarch64 には open/stat/lstat/access/readlink が存在しない
#[cfg(target_arch = "aarch64")]
const PATH_SYSCALLS: &[PathSyscall] = &[
    PathSyscall::new(libc::SYS_execve, "execve", 0),
    PathSyscall::new(libc::SYS_openat, "openat", 1),
    PathSyscall::new(libc::SYS_newfstatat, "newfstatat", 1),
    PathSyscall::new(libc::SYS_statx, "statx", 1),
    PathSyscall::new(libc::SYS_faccessat, "faccessat", 1),
    PathSyscall::new(libc::SYS_readlinkat, "readlinkat", 1),
    PathSyscall::new(libc::SYS_execveat, "execveat", 1),
    PathSyscall::new(libc::SYS_name_to_handle_at, "name_to_handle_at", 1),
];

fn lookup(number: i64) -> Option<&'static PathSyscall> {
    PATH_SYSCALLS
        .iter()
        .find(|sys| i64::from(sys.number) == number)
}

/// システムコール入口で判別された内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallEvent {
    /// システムコール番号
    pub number: i64,
    /// パスを受け取る引数の位置（対象外のシステムコールでは `None`）
    pub path_argument: Option<usize>,
}

impl SyscallEvent {
    /// システムコール名（対象外のシステムコールでは `None`）
    pub fn name(&self) -> Option<&'static str> {
        lookup(self.number).map(|sys| sys.name)
    }

    /// パス引数のアドレスを取得する
    ///
    /// 対象外のシステムコール、またはNULLポインタの場合は `None` を返します。
    pub fn path_address<R: SyscallRegisters + ?Sized>(&self, regs: &R) -> Option<u64> {
        let index = self.path_argument?;
        regs.argument(index).filter(|&addr| addr != 0)
    }
}

/// レジスタスナップショットからシステムコールを判別する
pub fn decode<R: SyscallRegisters + ?Sized>(regs: &R) -> SyscallEvent {
    let number = regs.syscall_number();
    SyscallEvent {
        number,
        path_argument: lookup(number).map(|sys| sys.path_argument),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deptrace_target::NativeRegisters;

    #[cfg(target_arch = "x86_64")]
    fn regs(number: libc::c_long, args: [u64; 6]) -> NativeRegisters {
        NativeRegisters {
            orig_rax: number as u64,
            rdi: args[0],
            rsi: args[1],
            rdx: args[2],
            r10: args[3],
            r8: args[4],
            r9: args[5],
        }
    }

    #[cfg(target_arch = "x86")]
    fn regs(number: libc::c_long, args: [u64; 6]) -> NativeRegisters {
        NativeRegisters {
            orig_eax: number,
            ebx: args[0] as u32,
            ecx: args[1] as u32,
            edx: args[2] as u32,
            esi: args[3] as u32,
            edi: args[4] as u32,
            ebp: args[5] as u32,
        }
    }

    #[cfg(target_arch = "aarch64")]
    fn regs(number: libc::c_long, args: [u64; 6]) -> NativeRegisters {
        NativeRegisters {
            syscallno: number as i32,
            regs: args,
        }
    }

    #[test]
    fn test_openat_uses_second_argument() {
        let snapshot = regs(libc::SYS_openat, [0xffff_ff9c, 0x1000, 0, 0, 0, 0]);
        let event = decode(&snapshot);

        assert_eq!(event.path_argument, Some(1));
        assert_eq!(event.name(), Some("openat"));
        assert_eq!(event.path_address(&snapshot), Some(0x1000));
    }

    #[test]
    fn test_execve_uses_first_argument() {
        let snapshot = regs(libc::SYS_execve, [0x2000, 0x3000, 0x4000, 0, 0, 0]);
        let event = decode(&snapshot);

        assert_eq!(event.path_argument, Some(0));
        assert_eq!(event.path_address(&snapshot), Some(0x2000));
    }

    #[test]
    fn test_required_syscalls_are_covered() {
        let mut required = vec![
            libc::SYS_openat,
            libc::SYS_statx,
            libc::SYS_execve,
            libc::SYS_execveat,
            libc::SYS_name_to_handle_at,
        ];
        #[cfg(target_arch = "x86_64")]
        required.extend([libc::SYS_open, libc::SYS_stat, libc::SYS_lstat, libc::SYS_newfstatat]);
        #[cfg(target_arch = "x86")]
        required.extend([libc::SYS_open, libc::SYS_stat, libc::SYS_lstat, libc::SYS_fstatat64]);
        #[cfg(target_arch = "aarch64")]
        required.push(libc::SYS_newfstatat);

        for number in required {
            let event = decode(&regs(number, [0; 6]));
            assert!(event.path_argument.is_some(), "syscall {} not decoded", number);
        }
    }

    #[test]
    fn test_unrelated_syscall_is_not_applicable() {
        for number in [libc::SYS_getpid, libc::SYS_write, libc::SYS_close] {
            let snapshot = regs(number, [0x1000; 6]);
            let event = decode(&snapshot);

            assert_eq!(event.path_argument, None);
            assert_eq!(event.name(), None);
            assert_eq!(event.path_address(&snapshot), None);
        }
    }

    #[test]
    fn test_null_path_pointer_has_no_address() {
        let snapshot = regs(libc::SYS_openat, [0xffff_ff9c, 0, 0, 0, 0, 0]);
        let event = decode(&snapshot);

        assert_eq!(event.path_argument, Some(1));
        assert_eq!(event.path_address(&snapshot), None);
    }

    #[test]
    fn test_no_syscall_marker_is_not_applicable() {
        let event = decode(&regs(-1, [0; 6]));
        assert_eq!(event.number, -1);
        assert_eq!(event.path_argument, None);
    }
}
