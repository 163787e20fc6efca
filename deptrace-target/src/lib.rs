//! deptrace ターゲットプロセス制御
//!
//! このクレートは、トレース対象の子プロセスを制御するための低レベル機能を提供します。
//! プロセスの起動とptraceによる停止・再開、レジスタスナップショットの取得、
//! 子プロセスのアドレス空間からの文字列読み取りなどを行います。

pub mod process;
pub mod memory;
pub mod registers;

pub use process::{Process, StopReason, TraceOutcome};
pub use memory::{Memory, RemoteString};
pub use registers::{
    Aarch64Registers, NativeRegisters, RegisterError, SyscallRegisters, X86Registers,
    X86_64Registers,
};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
