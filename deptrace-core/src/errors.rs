//! トレース中のエラー

use deptrace_target::RegisterError;
use thiserror::Error;

/// トレースを中断する致命的エラー
///
/// リモートメモリの読み取り失敗やstatの失敗はイベント単位で処理されるため、ここには含まれません。
#[derive(Debug, Error)]
pub enum TraceError {
    /// レジスタやシステムコール番号を取得できなかった
    #[error("inconsistent tracee state: {0}")]
    Registers(#[from] RegisterError),

    /// 再開・待機・オプション設定に失敗した
    #[error("ptrace control failed: {0:#}")]
    Ptrace(anyhow::Error),

    /// 出力先への書き込みに失敗した
    #[error("failed to write trace output: {0}")]
    Output(#[from] std::io::Error),
}
