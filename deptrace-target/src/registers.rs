//! レジスタアクセス機能
//!
//! システムコール停止時のレジスタスナップショットを扱います。
//! アーキテクチャごとに具象型を持ち、いずれも [`SyscallRegisters`] を実装します。
//! 実行時に使う型はビルド対象に応じて [`NativeRegisters`] として選ばれます。

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
compile_error!("deptrace supports only x86_64, x86 and aarch64 targets");

/// システムコール引数として使われるレジスタの数
pub const SYSCALL_ARG_COUNT: usize = 6;

/// レジスタ取得の失敗
///
/// トレーサとカーネルの状態が食い違っていることを示すため、呼び出し側では致命的エラーとして扱います。
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("failed to read general purpose registers of pid {pid}: {source}")]
    GeneralPurpose { pid: Pid, source: Errno },

    #[error("failed to read syscall number of pid {pid}: {source}")]
    SyscallNumber { pid: Pid, source: Errno },

    #[error("register set size mismatch: expected {expected} bytes, kernel returned {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// システムコール停止時のレジスタスナップショットが提供する機能
pub trait SyscallRegisters {
    /// システムコール番号
    fn syscall_number(&self) -> i64;

    /// `index` 番目（0..=5）のシステムコール引数
    fn argument(&self, index: usize) -> Option<u64>;
}

/// x86_64 のスナップショット（引数は rdi, rsi, rdx, r10, r8, r9）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86_64Registers {
    pub orig_rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub r10: u64,
    pub r8: u64,
    pub r9: u64,
}

impl SyscallRegisters for X86_64Registers {
    fn syscall_number(&self) -> i64 {
        self.orig_rax as i64
    }

    fn argument(&self, index: usize) -> Option<u64> {
        match index {
            0 => Some(self.rdi),
            1 => Some(self.rsi),
            2 => Some(self.rdx),
            3 => Some(self.r10),
            4 => Some(self.r8),
            5 => Some(self.r9),
            _ => None,
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl From<nix::libc::user_regs_struct> for X86_64Registers {
    fn from(regs: nix::libc::user_regs_struct) -> Self {
        Self {
            orig_rax: regs.orig_rax,
            rdi: regs.rdi,
            rsi: regs.rsi,
            rdx: regs.rdx,
            r10: regs.r10,
            r8: regs.r8,
            r9: regs.r9,
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl X86_64Registers {
    /// 停止中のプロセスからスナップショットを取得する
    pub fn capture(pid: Pid) -> Result<Self, RegisterError> {
        let regs = nix::sys::ptrace::getregs(pid)
            .map_err(|source| RegisterError::GeneralPurpose { pid, source })?;
        Ok(regs.into())
    }
}

/// i386 のスナップショット（引数は ebx, ecx, edx, esi, edi, ebp）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86Registers {
    pub orig_eax: i32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
}

impl SyscallRegisters for X86Registers {
    fn syscall_number(&self) -> i64 {
        i64::from(self.orig_eax)
    }

    fn argument(&self, index: usize) -> Option<u64> {
        let value = match index {
            0 => self.ebx,
            1 => self.ecx,
            2 => self.edx,
            3 => self.esi,
            4 => self.edi,
            5 => self.ebp,
            _ => return None,
        };
        Some(u64::from(value))
    }
}

#[cfg(target_arch = "x86")]
impl From<nix::libc::user_regs_struct> for X86Registers {
    fn from(regs: nix::libc::user_regs_struct) -> Self {
        Self {
            orig_eax: regs.orig_eax as i32,
            ebx: regs.ebx as u32,
            ecx: regs.ecx as u32,
            edx: regs.edx as u32,
            esi: regs.esi as u32,
            edi: regs.edi as u32,
            ebp: regs.ebp as u32,
        }
    }
}

#[cfg(target_arch = "x86")]
impl X86Registers {
    /// 停止中のプロセスからスナップショットを取得する
    pub fn capture(pid: Pid) -> Result<Self, RegisterError> {
        let regs = nix::sys::ptrace::getregs(pid)
            .map_err(|source| RegisterError::GeneralPurpose { pid, source })?;
        Ok(regs.into())
    }
}

/// aarch64 のスナップショット（引数は x0..x5）
///
/// aarch64 では汎用レジスタにシステムコール番号が残らないため、
/// `NT_ARM_SYSTEM_CALL` レジスタセットから別途読み取った値を保持します。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aarch64Registers {
    pub syscallno: i32,
    pub regs: [u64; SYSCALL_ARG_COUNT],
}

impl SyscallRegisters for Aarch64Registers {
    fn syscall_number(&self) -> i64 {
        i64::from(self.syscallno)
    }

    fn argument(&self, index: usize) -> Option<u64> {
        self.regs.get(index).copied()
    }
}

/// linux/elf.h の NT_ARM_SYSTEM_CALL
#[cfg(target_arch = "aarch64")]
const NT_ARM_SYSTEM_CALL: usize = 0x404;

#[cfg(target_arch = "aarch64")]
impl Aarch64Registers {
    /// 停止中のプロセスからスナップショットを取得する
    pub fn capture(pid: Pid) -> Result<Self, RegisterError> {
        use nix::sys::ptrace::{self, regset};

        let gprs = ptrace::getregset::<regset::NT_PRSTATUS>(pid)
            .map_err(|source| RegisterError::GeneralPurpose { pid, source })?;

        let mut regs = [0u64; SYSCALL_ARG_COUNT];
        regs.copy_from_slice(&gprs.regs[..SYSCALL_ARG_COUNT]);

        Ok(Self {
            syscallno: read_syscall_number(pid)?,
            regs,
        })
    }
}

/// PTRACE_GETREGSET で NT_ARM_SYSTEM_CALL を読み取る
#[cfg(target_arch = "aarch64")]
fn read_syscall_number(pid: Pid) -> Result<i32, RegisterError> {
    use nix::libc;
    use std::mem::size_of;

    let mut syscallno: libc::c_int = 0;
    let mut iov = libc::iovec {
        iov_base: (&mut syscallno as *mut libc::c_int).cast(),
        iov_len: size_of::<libc::c_int>(),
    };

    // SAFETY: iov は syscallno を指しており、カーネルは iov_len を超えて書き込まない
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            NT_ARM_SYSTEM_CALL as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    Errno::result(res).map_err(|source| RegisterError::SyscallNumber { pid, source })?;

    if iov.iov_len != size_of::<libc::c_int>() {
        return Err(RegisterError::SizeMismatch {
            expected: size_of::<libc::c_int>(),
            actual: iov.iov_len,
        });
    }

    Ok(syscallno)
}

/// ビルド対象アーキテクチャのスナップショット型
#[cfg(target_arch = "x86_64")]
pub type NativeRegisters = X86_64Registers;

/// ビルド対象アーキテクチャのスナップショット型
#[cfg(target_arch = "x86")]
pub type NativeRegisters = X86Registers;

/// ビルド対象アーキテクチャのスナップショット型
#[cfg(target_arch = "aarch64")]
pub type NativeRegisters = Aarch64Registers;

/// レジスタアクセス
pub struct Registers {
    pid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// 現在の停止位置でのスナップショットを取得する
    pub fn snapshot(&self) -> Result<NativeRegisters, RegisterError> {
        NativeRegisters::capture(self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x86_64_argument_order() {
        let regs = X86_64Registers {
            orig_rax: 257,
            rdi: 10,
            rsi: 11,
            rdx: 12,
            r10: 13,
            r8: 14,
            r9: 15,
        };

        assert_eq!(regs.syscall_number(), 257);
        let args: Vec<u64> = (0..SYSCALL_ARG_COUNT).filter_map(|i| regs.argument(i)).collect();
        assert_eq!(args, vec![10, 11, 12, 13, 14, 15]);
        assert_eq!(regs.argument(6), None);
    }

    #[test]
    fn test_x86_64_no_syscall_is_negative() {
        // syscall-stop 以外では orig_rax は -1
        let regs = X86_64Registers {
            orig_rax: u64::MAX,
            ..Default::default()
        };
        assert_eq!(regs.syscall_number(), -1);
    }

    #[test]
    fn test_x86_argument_order() {
        let regs = X86Registers {
            orig_eax: 5,
            ebx: 1,
            ecx: 2,
            edx: 3,
            esi: 4,
            edi: 5,
            ebp: 0xffff_fff0,
        };

        assert_eq!(regs.syscall_number(), 5);
        assert_eq!(regs.argument(0), Some(1));
        assert_eq!(regs.argument(4), Some(5));
        // 32ビット値はゼロ拡張される
        assert_eq!(regs.argument(5), Some(0xffff_fff0));
        assert_eq!(regs.argument(6), None);
    }

    #[test]
    fn test_aarch64_uses_separate_syscall_number() {
        let regs = Aarch64Registers {
            syscallno: 56,
            regs: [0xffff_ffff_ff9c, 0x4000, 0, 0, 0, 0],
        };

        assert_eq!(regs.syscall_number(), 56);
        assert_eq!(regs.argument(1), Some(0x4000));
        assert_eq!(regs.argument(6), None);
    }
}
