//! deptrace のコア機能
//!
//! このクレートは、トレースの中核となるロジックを提供します。
//! システムコールの判別、パスの存在確認、トレースセッションの制御ループを統合します。

pub mod classify;
pub mod errors;
pub mod session;
pub mod syscall;

pub use classify::{classify, write_line, Existence};
pub use errors::TraceError;
pub use session::TraceSession;
pub use syscall::{decode, SyscallEvent};

// 他のクレートから使用するために再エクスポート
pub use deptrace_target::{Process, RemoteString, TraceOutcome};
