//! CRLF行フレーミング
//!
//! バイトストリームをCRLF区切りの行へ分解する小さなステートフルリーダー。
//! TMIソケットとコマンドインターフェースの両方で共用する。

use tokio::io::{AsyncRead, AsyncReadExt};

/// セパレーターなしで蓄積を許容する上限バイト数
///
/// これを超えたらバッファを破棄して読み続ける（不正なピア対策）。
const MAX_LINE_BYTES: usize = 64 * 1024;

/// CRLF区切りの行リーダー
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            eof: false,
        }
    }

    /// 次の1行を返す。ストリーム終端で`None`。
    ///
    /// 終端時に未完の残りがある場合、末尾が`\r`ならセパレーターの後半
    /// 1バイトが失われたとみなして有効な最終行として返す。
    /// それ以外の残りは不完全なメッセージとして破棄する。
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            // バッファ内のCRLFを探す
            if let Some(i) = find_crlf(&self.buf) {
                let rest = self.buf.split_off(i + 2);
                self.buf.truncate(i);
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf = rest;
                log::trace!("Line read: {}", line.escape_debug());
                return Ok(Some(line));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let mut remainder = std::mem::take(&mut self.buf);
                if remainder.last() == Some(&b'\r') {
                    remainder.pop();
                    let line = String::from_utf8_lossy(&remainder).into_owned();
                    log::trace!("Final line read: {}", line.escape_debug());
                    return Ok(Some(line));
                }
                log::debug!(
                    "Dropping incomplete line at end of stream ({} bytes)",
                    remainder.len()
                );
                return Ok(None);
            }

            // セパレーターなしで溜まりすぎたら破棄して読み続ける
            if self.buf.len() > MAX_LINE_BYTES {
                log::warn!(
                    "Separator not found within {} bytes, purging buffer",
                    MAX_LINE_BYTES
                );
                self.buf.clear();
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                self.eof = true;
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(input: &[u8]) -> Vec<String> {
        let mut reader = LineReader::new(input);
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await.unwrap() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_basic_lines() {
        let lines = read_all(b"PING :tmi\r\nPONG :tmi\r\n").await;
        assert_eq!(lines, vec!["PING :tmi", "PONG :tmi"]);
    }

    #[tokio::test]
    async fn test_empty_stream() {
        assert!(read_all(b"").await.is_empty());
    }

    #[tokio::test]
    async fn test_final_line_missing_lf() {
        // ソケットが早く閉じてLFが失われたケース
        let lines = read_all(b"first\r\nsecond\r").await;
        assert_eq!(lines, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_unterminated_remainder_dropped() {
        let lines = read_all(b"first\r\nsecond").await;
        assert_eq!(lines, vec!["first"]);
    }

    #[tokio::test]
    async fn test_overrun_purges_buffer() {
        // 上限超過分は破棄され、その後の行は読める
        let mut input = vec![b'a'; MAX_LINE_BYTES + 100];
        input.extend_from_slice(b"\r\nok\r\n");
        let lines = read_all(&input).await;
        assert_eq!(lines.last().unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_lossy_decoding() {
        let lines = read_all(b"abc\xff\xfedef\r\n").await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("abc"));
        assert!(lines[0].ends_with("def"));
    }
}
