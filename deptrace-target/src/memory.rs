//! メモリアクセス機能

use crate::Result;
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use tracing::trace;

/// PTRACE_PEEKDATA 1回で読み取れるバイト数
pub const WORD_SIZE: usize = std::mem::size_of::<nix::libc::c_long>();

/// 文字列バッファの初期容量
const INITIAL_CAPACITY: usize = 4096;

/// 子プロセスのアドレス空間から読み取ったNUL終端文字列
///
/// 終端のNULは含みません。空文字列は「パスなし」を意味します。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteString {
    bytes: Vec<u8>,
}

impl RemoteString {
    /// 生のバイト列を取得する
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// OsStr として取得する
    pub fn as_os_str(&self) -> &OsStr {
        OsStr::from_bytes(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Display for RemoteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

/// メモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// PTRACE_PEEKDATAで1ワード読み取る
    pub fn read_word(&self, addr: u64) -> Result<[u8; WORD_SIZE]> {
        let word = ptrace::read(self.pid, addr as usize as ptrace::AddressType)
            .map_err(|e| anyhow::anyhow!("Failed to read via ptrace at 0x{:x}: {}", addr, e))?;
        Ok(word.to_ne_bytes())
    }

    /// 子プロセスのメモリからNUL終端文字列を読み取る
    ///
    /// 読み取りに失敗した場合はそこまでに読めた部分を返します。
    /// アドレスが0の場合は読み取りを行わず空文字列を返します。
    pub fn read_cstring(&self, addr: u64) -> RemoteString {
        read_cstring_with(addr, |word_addr| self.read_word(word_addr))
    }
}

/// ワード単位の読み取り関数を使ってNUL終端文字列を組み立てる
///
/// バッファ容量は足りなくなるたびに2倍に拡張されます。
pub fn read_cstring_with<F>(addr: u64, mut read_word: F) -> RemoteString
where
    F: FnMut(u64) -> Result<[u8; WORD_SIZE]>,
{
    if addr == 0 {
        return RemoteString::default();
    }

    let mut buffer: Vec<u8> = Vec::with_capacity(INITIAL_CAPACITY);
    let mut offset: u64 = 0;

    loop {
        if buffer.len() + WORD_SIZE > buffer.capacity() {
            let doubled = buffer.capacity() * 2;
            buffer.reserve_exact(doubled - buffer.len());
        }

        let Some(word_addr) = addr.checked_add(offset) else {
            break;
        };

        let word = match read_word(word_addr) {
            Ok(word) => word,
            Err(e) => {
                // 読み取れない領域に到達した: ここまでの内容で確定する
                trace!("remote string read stopped after {} bytes: {}", buffer.len(), e);
                break;
            }
        };

        if let Some(nul) = word.iter().position(|&b| b == 0) {
            buffer.extend_from_slice(&word[..nul]);
            break;
        }

        buffer.extend_from_slice(&word);
        offset += WORD_SIZE as u64;
    }

    RemoteString { bytes: buffer }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x7fff_0000;

    /// `data` を BASE に配置した擬似メモリ。範囲外の読み取りは失敗する
    fn fake_memory(data: &[u8]) -> impl FnMut(u64) -> Result<[u8; WORD_SIZE]> + '_ {
        move |addr: u64| -> Result<[u8; WORD_SIZE]> {
            let start = addr
                .checked_sub(BASE)
                .ok_or_else(|| anyhow::anyhow!("unmapped address 0x{:x}", addr))? as usize;
            let chunk = data
                .get(start..start + WORD_SIZE)
                .ok_or_else(|| anyhow::anyhow!("unmapped address 0x{:x}", addr))?;
            let mut word = [0u8; WORD_SIZE];
            word.copy_from_slice(chunk);
            Ok(word)
        }
    }

    fn padded(s: &[u8], total: usize) -> Vec<u8> {
        let mut data = s.to_vec();
        data.resize(total, 0xAA);
        data
    }

    #[test]
    fn test_read_short_string_truncated_mid_chunk() {
        let data = padded(b"/bin/sh\0", 64);
        let s = read_cstring_with(BASE, fake_memory(&data));
        assert_eq!(s.as_bytes(), b"/bin/sh");
        assert_eq!(s.len(), 7);
    }

    #[test]
    fn test_read_string_spanning_chunks() {
        let data = padded(b"/etc/ld.so.cache\0garbage", 64);
        let s = read_cstring_with(BASE, fake_memory(&data));
        assert_eq!(s.as_bytes(), b"/etc/ld.so.cache");
    }

    #[test]
    fn test_nul_exactly_at_word_boundary() {
        let mut data = vec![b'x'; WORD_SIZE];
        data.push(0);
        let data = padded(&data, WORD_SIZE * 4);

        let s = read_cstring_with(BASE, fake_memory(&data));
        assert_eq!(s.as_bytes(), vec![b'x'; WORD_SIZE].as_slice());
    }

    #[test]
    fn test_read_failure_keeps_prefix() {
        // NULが現れる前にマッピングの終端に達する
        let data = vec![b'a'; WORD_SIZE * 3];
        let s = read_cstring_with(BASE, fake_memory(&data));
        assert_eq!(s.len(), WORD_SIZE * 3);
        assert!(s.as_bytes().iter().all(|&b| b == b'a'));
    }

    #[test]
    fn test_read_failure_on_first_word_is_empty() {
        let s = read_cstring_with(BASE, |_| Err(anyhow::anyhow!("EIO")));
        assert!(s.is_empty());
    }

    #[test]
    fn test_null_address_performs_no_read() {
        let s = read_cstring_with(0, |_| panic!("must not read at address 0"));
        assert!(s.is_empty());
    }

    #[test]
    fn test_long_string_grows_buffer() {
        let mut data = vec![b'p'; 10_000];
        data.push(0);
        let data = padded(&data, 10_000 + WORD_SIZE * 2);

        let s = read_cstring_with(BASE, fake_memory(&data));
        assert_eq!(s.len(), 10_000);
    }

    #[test]
    fn test_non_utf8_bytes_are_preserved() {
        let data = padded(b"/tmp/\xff\xfe\0", 32);
        let s = read_cstring_with(BASE, fake_memory(&data));
        assert_eq!(s.as_bytes(), b"/tmp/\xff\xfe");
        assert_eq!(s.as_os_str().as_bytes(), b"/tmp/\xff\xfe");
    }
}
