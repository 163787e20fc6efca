//! パスの存在確認と出力行の書き込み
//!
//! パスはトレーサ自身のカレントディレクトリ・マウント名前空間・ルートで解釈されます。
//! 子プロセスが chdir や chroot を行った場合、相対パスやchroot内のパスは正しく判定されません。

use std::ffi::OsStr;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use tracing::trace;

/// 存在確認の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    Exists,
    Missing,
}

impl Existence {
    /// 出力行の先頭に書くタグ
    pub fn tag(&self) -> &'static str {
        match self {
            Existence::Exists => "exists",
            Existence::Missing => "missing",
        }
    }
}

/// パスが存在するかをstat(2)で判定する
///
/// statが失敗した場合は理由によらず `Missing` になります。
pub fn classify(path: &[u8]) -> Existence {
    match std::fs::metadata(OsStr::from_bytes(path)) {
        Ok(_) => Existence::Exists,
        Err(e) => {
            trace!("stat {:?} failed: {}", OsStr::from_bytes(path), e);
            Existence::Missing
        }
    }
}

/// `<tag>\t<path>\n` の1行を書き込む
///
/// パスはエスケープせずにそのままのバイト列で書き込みます。
pub fn write_line<W>(sink: &mut W, existence: Existence, path: &[u8]) -> io::Result<()>
where
    W: Write + ?Sized,
{
    sink.write_all(existence.tag().as_bytes())?;
    sink.write_all(b"\t")?;
    sink.write_all(path)?;
    sink.write_all(b"\n")
}
