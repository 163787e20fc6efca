//! トレースセッション
//!
//! 1つの子プロセスをシステムコール停止ごとに停止・再開させ、
//! パス引数を持つシステムコールの入口でパスを読み取って存在確認の結果を書き込みます。

use crate::classify::{classify, write_line};
use crate::errors::TraceError;
use crate::syscall;
use deptrace_target::process::StopReason;
use deptrace_target::registers::Registers;
use deptrace_target::{Memory, Process, TraceOutcome};
use std::io::Write;
use tracing::{debug, trace};

/// セッション中の統計情報
#[derive(Debug, Clone, Copy, Default)]
struct TraceStats {
    /// システムコール停止の回数（入口と出口の両方を数える）
    syscall_stops: u64,
    /// パス引数がNULL以外だったシステムコールの数
    path_events: u64,
    /// 書き込んだ行数
    lines_written: u64,
}

/// トレースセッション
///
/// トレース対象プロセスと出力先を所有し、1回の実行の状態をすべて保持します。
pub struct TraceSession<W: Write> {
    /// トレース対象プロセス
    process: Process,
    /// メモリアクセス
    memory: Memory,
    /// レジスタアクセス
    registers: Registers,
    /// 出力先
    sink: W,
    /// 入口停止を処理済みで、対応する出口停止を待っているか
    in_syscall: bool,
    stats: TraceStats,
}

impl<W: Write> TraceSession<W> {
    /// 起動直後で停止しているプロセスからセッションを作成する
    pub fn new(process: Process, sink: W) -> Self {
        let pid = process.pid();
        Self {
            process,
            memory: Memory::new(pid),
            registers: Registers::new(pid),
            sink,
            in_syscall: false,
            stats: TraceStats::default(),
        }
    }

    /// 子プロセスが終了するまでトレースする
    ///
    /// 子プロセスの終了状態を返します。レジスタの取得やptrace操作に失敗した場合は
    /// その時点でトレースを中断し、子プロセスはkillされます。
    pub fn run(mut self) -> Result<TraceOutcome, TraceError> {
        self.process
            .enable_syscall_tracing()
            .map_err(TraceError::Ptrace)?;

        let mut pending_signal: Option<i32> = None;

        loop {
            let reason = self
                .process
                .syscall_and_wait(pending_signal.take())
                .map_err(TraceError::Ptrace)?;

            match reason {
                StopReason::Syscall => {
                    self.stats.syscall_stops += 1;
                    if self.in_syscall {
                        // 出口停止: 戻り値は使わないのでそのまま再開する
                        self.in_syscall = false;
                    } else {
                        self.in_syscall = true;
                        self.handle_syscall_entry()?;
                    }
                }
                StopReason::Event(event) => {
                    trace!("ptrace event {} on {}", event, self.process.pid());
                }
                StopReason::Signal(signal) => {
                    trace!("forwarding signal {} to {}", signal, self.process.pid());
                    pending_signal = Some(signal);
                }
                StopReason::Exited(code) => return self.finish(TraceOutcome::Exited(code)),
                StopReason::Signaled(signal) => {
                    return self.finish(TraceOutcome::Signaled(signal));
                }
                StopReason::Other => {}
            }
        }
    }

    /// システムコール入口での処理
    ///
    /// 引数はカーネルが書き換える前の入口でのみ読み取ります。
    fn handle_syscall_entry(&mut self) -> Result<(), TraceError> {
        let regs = self.registers.snapshot()?;
        let event = syscall::decode(&regs);

        let Some(addr) = event.path_address(&regs) else {
            return Ok(());
        };
        self.stats.path_events += 1;

        let path = self.memory.read_cstring(addr);
        trace!(
            "{}(..., 0x{:x} = {:?}, ...)",
            event.name().unwrap_or("?"),
            addr,
            path.to_string()
        );

        if path.is_empty() {
            return Ok(());
        }

        let existence = classify(path.as_bytes());
        write_line(&mut self.sink, existence, path.as_bytes())?;
        self.stats.lines_written += 1;
        Ok(())
    }

    fn finish(mut self, outcome: TraceOutcome) -> Result<TraceOutcome, TraceError> {
        self.sink.flush()?;
        debug!(
            "child {} finished with {:?}: {} syscall stops, {} path events, {} lines",
            self.process.pid(),
            outcome,
            self.stats.syscall_stops,
            self.stats.path_events,
            self.stats.lines_written
        );
        Ok(outcome)
    }
}
