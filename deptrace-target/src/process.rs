//! プロセス制御機能
//!
//! リアルタイムシグナルは `nix::sys::signal::Signal` で表現できないため、
//! 待機状態の解析とシグナルの再配送は生のシグナル番号（i32）で扱います。

use crate::Result;
use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use tracing::{debug, warn};

/// 子プロセスで execvp が失敗した場合の終了コード
pub const EXEC_FAILURE_CODE: i32 = 127;

/// 停止イベントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// システムコールの入口または出口での停止（TRACESYSGOOD）
    Syscall,
    /// ptraceイベント（exec など）
    Event(i32),
    /// シグナル配送による停止（シグナル番号）
    Signal(i32),
    /// プロセス終了
    Exited(i32),
    /// シグナルによる終了（シグナル番号）
    Signaled(i32),
    /// その他の状態変化
    Other,
}

/// waitpid が返す生のステータスを解析する
pub fn decode_wait_status(status: i32) -> StopReason {
    if libc::WIFEXITED(status) {
        StopReason::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        StopReason::Signaled(libc::WTERMSIG(status))
    } else if libc::WIFSTOPPED(status) {
        let signal = libc::WSTOPSIG(status);
        let event = status >> 16;
        if signal == libc::SIGTRAP | 0x80 {
            StopReason::Syscall
        } else if event != 0 {
            StopReason::Event(event)
        } else {
            StopReason::Signal(signal)
        }
    } else {
        StopReason::Other
    }
}

/// トレース対象プロセスの最終状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOutcome {
    Exited(i32),
    /// シグナルによる終了（シグナル番号）
    Signaled(i32),
}

impl TraceOutcome {
    /// トレーサ自身の終了コードとして使う値
    ///
    /// シグナルで終了した場合はシェルと同じく 128 + シグナル番号を返します。
    pub fn exit_code(&self) -> i32 {
        match self {
            TraceOutcome::Exited(code) => *code,
            TraceOutcome::Signaled(signal) => 128 + *signal,
        }
    }
}

/// トレース対象のプロセス
///
/// 終了を確認する前に破棄された場合は、子プロセスをkillして回収します。
pub struct Process {
    pid: Pid,
    reaped: bool,
}

impl Process {
    /// プログラムを起動してトレース対象プロセスを開始する
    ///
    /// 子プロセスは PTRACE_TRACEME を設定し、自身に SIGSTOP を送ってから
    /// execvp で対象プログラムを実行します。
    /// この関数は子プロセスが SIGSTOP で停止したことを確認してから返ります。
    pub fn spawn<P, A>(program: P, args: &[A]) -> Result<Self>
    where
        P: AsRef<OsStr>,
        A: AsRef<OsStr>,
    {
        use nix::unistd::{fork, ForkResult};

        // fork後の子プロセスではメモリ確保を行わないよう、argvのポインタ配列までここで作る
        let program_cstring = CString::new(program.as_ref().as_bytes())?;
        let mut cstring_args = vec![program_cstring.clone()];
        for arg in args {
            cstring_args.push(CString::new(arg.as_ref().as_bytes())?);
        }
        let mut argv: Vec<*const libc::c_char> =
            cstring_args.iter().map(|a| a.as_ptr()).collect();
        argv.push(std::ptr::null());

        match unsafe { fork()? } {
            ForkResult::Parent { child } => {
                debug!("spawned child {} for {:?}", child, program_cstring);
                let mut process = Self { pid: child, reaped: false };
                match process.wait()? {
                    StopReason::Signal(libc::SIGSTOP) => Ok(process),
                    reason => Err(anyhow::anyhow!(
                        "Unexpected stop while starting child: {:?}",
                        reason
                    )),
                }
            }
            ForkResult::Child => {
                if let Err(e) = ptrace::traceme() {
                    eprintln!("deptrace: PTRACE_TRACEME failed: {}", e);
                    unsafe { libc::_exit(EXEC_FAILURE_CODE) };
                }

                // トレーサが待機を終えるまでここで止まる
                if let Err(e) = nix::sys::signal::raise(Signal::SIGSTOP) {
                    eprintln!("deptrace: failed to stop before exec: {}", e);
                    unsafe { libc::_exit(EXEC_FAILURE_CODE) };
                }

                // SAFETY: argv はNULL終端で、各要素は cstring_args が所有する文字列を指す
                unsafe { libc::execvp(program_cstring.as_ptr(), argv.as_ptr()) };

                // execvpは成功すると戻ってこない
                eprintln!(
                    "deptrace: failed to execute {:?}: {}",
                    program_cstring,
                    Errno::last()
                );
                unsafe { libc::_exit(EXEC_FAILURE_CODE) }
            }
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// システムコール停止を有効にするptraceオプションを設定する
    ///
    /// EXITKILL により、トレーサが終了した場合は子プロセスもカーネルによってkillされます。
    pub fn enable_syscall_tracing(&self) -> Result<()> {
        let options = ptrace::Options::PTRACE_O_TRACESYSGOOD
            | ptrace::Options::PTRACE_O_TRACEEXEC
            | ptrace::Options::PTRACE_O_EXITKILL;
        ptrace::setoptions(self.pid, options)?;
        debug!("ptrace options set on {}: {:?}", self.pid, options);
        Ok(())
    }

    /// 次のシステムコール停止まで実行を再開して停止イベントを待機する
    ///
    /// `signal` が指定された場合はそのシグナル番号を子プロセスに配送してから再開します。
    pub fn syscall_and_wait(&mut self, signal: Option<i32>) -> Result<StopReason> {
        let data = signal.unwrap_or(0) as usize as *mut libc::c_void;

        // SAFETY: PTRACE_SYSCALL は addr を無視し、data をシグナル番号として扱う
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_SYSCALL,
                self.pid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                data,
            )
        };
        Errno::result(res)
            .map_err(|e| anyhow::anyhow!("PTRACE_SYSCALL on {} failed: {}", self.pid, e))?;

        self.wait()
    }

    /// 子プロセスの次の状態変化を待機する
    pub fn wait(&mut self) -> Result<StopReason> {
        let status = wait_status(self.pid)?;
        let reason = decode_wait_status(status);

        match reason {
            StopReason::Exited(_) | StopReason::Signaled(_) => self.reaped = true,
            StopReason::Other => {
                warn!("unexpected wait status for {}: 0x{:x}", self.pid, status);
            }
            _ => {}
        }

        Ok(reason)
    }
}

/// waitpid で生のステータスを取得する（EINTRは再試行）
fn wait_status(pid: Pid) -> Result<i32> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: status は有効な書き込み先
        let res = unsafe { libc::waitpid(pid.as_raw(), &mut status, libc::__WALL) };
        match Errno::result(res) {
            Ok(_) => return Ok(status),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(anyhow::anyhow!("waitpid on {} failed: {}", pid, e)),
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        debug!("killing unfinished child {}", self.pid);
        let _ = nix::sys::signal::kill(self.pid, Signal::SIGKILL);
        let _ = wait_status(self.pid);
    }
}
