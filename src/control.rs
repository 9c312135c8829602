//! TCPコマンドインターフェース（Operator Control）
//!
//! オペレーターがtelnetやncで接続してショーを操作するための
//! 行指向プロトコル。同時接続は1クライアントのみで、新しい接続が
//! 来ると前の接続を閉じる。
//!
//! ## コマンド
//! on / off / join / clear / pause / resume / telnet / ?

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::PRGM_VERSION;
use crate::irc::{parse_params, LineReader};
use crate::show::ShowController;

/// バックスペース（0x08）を解釈して直前の1文字を消す
///
/// telnetクライアントはBSをそのまま送ってくるため、コマンド照合の前に
/// 打ち消しを適用する。行頭のBSは何も消さない。
pub fn interpret_backspace(line: &str) -> String {
    let mut out = String::new();
    for c in line.chars() {
        if c == '\u{0008}' {
            out.pop();
        } else {
            out.push(c);
        }
    }
    out
}

/// 1メッセージを送出する。行末は常にCR LF。
///
/// telnetモードではメッセージ内部の改行もCR LFへ変換する。
async fn send<W>(writer: &mut W, telnet: bool, msg: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    log::trace!("Remote Send: {:?}", msg);
    let msg = if telnet {
        msg.replace('\n', "\r\n")
    } else {
        msg.to_string()
    };
    writer.write_all(msg.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

fn hello_message(peer: &str) -> String {
    format!(
        "Matrix Display Controller v{}\nType '?' to obtain available commands.\nHello {}!",
        PRGM_VERSION, peer
    )
}

const HELP_PROMPT: &[&str] = &[
    "  ** Command list **",
    "     ? - Shows this message.",
    "    ON - Starts operation.",
    "   OFF - Stops operation.",
    " CLEAR - Clears all queues and the matrix display.",
    " PAUSE - Stops sending images to the matrix display, emotes and emoji collection remaining active.",
    "RESUME - Resumes sending images to the matrix display. The backlog is sent.",
    "TELNET - All line breaks (LF) are converted to CR LF for the lifetime of the connection.",
    "JOIN :<#chan>{,<#chan>{,...}} - Joins <#chan>.",
];

/// 1クライアント分のコマンドループ
///
/// 読み書きをジェネリックにしてソケットなしでテストできるようにしている。
async fn handle_client<R, W>(
    show: Arc<ShowController>,
    reader: R,
    mut writer: W,
    peer: String,
    cancel: CancellationToken,
) -> io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = hello_message(&peer);
    let mut telnet = false;
    let mut lines = LineReader::new(reader);

    log::info!("Remote: {} opened a command connection.", peer);
    send(&mut writer, telnet, &hello).await?;

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };

        let line = if telnet {
            interpret_backspace(&line)
        } else {
            line
        };
        let (cmds, trailing) = parse_params(&line);
        let Some(cmd) = cmds.first() else {
            continue;
        };

        match cmd.to_lowercase().as_str() {
            "telnet" => {
                telnet = true;
                let msg = format!("CR LF line breaks\nBS is interpreted\n{}", hello);
                send(&mut writer, telnet, &msg).await?;
            }

            "on" => {
                if show.start().await {
                    log::info!("Remote: Commanded start.");
                    send(&mut writer, telnet, "Started the show.").await?;
                } else {
                    log::debug!("Remote: Start command failed.");
                    send(&mut writer, telnet, "Can't start the show.").await?;
                }
            }

            "off" => {
                if show.stop().await {
                    log::info!("Remote: Commanded stop.");
                    send(&mut writer, telnet, "Stopped the show.").await?;
                } else {
                    log::debug!("Remote: Stop command failed.");
                    send(&mut writer, telnet, "Can't stop the show.").await?;
                }
            }

            "join" => {
                log::debug!("Remote: Requested JOIN {:?}.", trailing);
                if show.join(&trailing) {
                    send(&mut writer, telnet, "JOIN command sent.").await?;
                } else {
                    send(&mut writer, telnet, "TMI is not ready.").await?;
                }
            }

            "clear" => {
                if show.clear_all().await {
                    log::info!("Remote: Cleared.");
                    send(&mut writer, telnet, "Cleared matrix display.").await?;
                } else {
                    log::debug!("Remote: Clear all command failed.");
                    send(&mut writer, telnet, "Error clearing matrix display.").await?;
                }
            }

            "pause" => {
                if show.pause().await {
                    log::info!("Remote: Paused display.");
                    send(&mut writer, telnet, "Paused display.").await?;
                } else {
                    log::debug!("Remote: Requested PAUSE while not running.");
                    send(&mut writer, telnet, "Show is not running!.").await?;
                }
            }

            "resume" => {
                if show.resume().await {
                    log::info!("Remote: Resumed displaying images.");
                    send(&mut writer, telnet, "Resumed display.").await?;
                } else {
                    log::debug!("Remote: Requested RESUME while not running.");
                    send(&mut writer, telnet, "Show is not running!.").await?;
                }
            }

            "?" | "help" | "h" => {
                send(&mut writer, telnet, &HELP_PROMPT.join("\n| ")).await?;
            }

            _ => {
                log::debug!("Remote: Unknown command.");
                send(&mut writer, telnet, "Unknown command!").await?;
            }
        }
    }

    log::info!("Remote: Command connection with {} ended.", peer);
    Ok(())
}

/// コマンドインターフェースのTCPサーバー
pub struct CommandServer {
    port: u16,
    show: Arc<ShowController>,
}

impl CommandServer {
    pub fn new(port: u16, show: Arc<ShowController>) -> Self {
        Self { port, show }
    }

    /// 待ち受けループ。バインド失敗は致命的エラーとして呼び出し元へ返す。
    pub async fn run(&self, cancel: CancellationToken) -> io::Result<()> {
        let listener = match TcpListener::bind(("0.0.0.0", self.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Remote: Unable to start command interface!");
                return Err(e);
            }
        };
        log::info!("Remote: Command interface listening on port {}.", self.port);

        // 同時に生かすクライアントは1つだけ
        let mut current_client: Option<CancellationToken> = None;

        loop {
            let (stream, addr) = tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Remote: Shutting down command interface.");
                    if let Some(token) = current_client.take() {
                        token.cancel();
                    }
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            // 既存クライアントを切ってから新しい接続を受け付ける
            if let Some(token) = current_client.take() {
                token.cancel();
            }
            let client_cancel = cancel.child_token();
            current_client = Some(client_cancel.clone());

            let show = Arc::clone(&self.show);
            let peer = addr.ip().to_string();
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                if let Err(e) = handle_client(show, reader, writer, peer, client_cancel).await {
                    log::debug!("Remote: client connection error: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::MatrixPusher;
    use crate::downloader::{ImageDownloader, SharedLadder, SourceUrls};
    use crate::extract::EmoteExtractor;
    use crate::irc::TmiClient;
    use crate::queue::EmoteQueue;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn show_for(server: &mockito::Server) -> (Arc<ShowController>, TempDir) {
        let queue = Arc::new(EmoteQueue::new());
        let ladder = Arc::new(SharedLadder::new());
        let forbidden_ids = Arc::new(Mutex::new(HashSet::new()));
        let cache = TempDir::new().unwrap();

        let handler = Arc::new(EmoteExtractor::new(
            Arc::clone(&queue),
            false,
            HashSet::new(),
            Arc::clone(&forbidden_ids),
        ));
        let tmi = Arc::new(TmiClient::new("testchannel", "", "", handler));
        let sources = SourceUrls {
            twitch_base: format!("{}/twitch", server.url()),
            emoji_base: format!("{}/emoji", server.url()),
        };
        let downloader = Arc::new(
            ImageDownloader::new(
                Arc::clone(&queue),
                forbidden_ids,
                Arc::clone(&ladder),
                sources,
                cache.path().to_path_buf(),
            )
            .unwrap(),
        );
        let pusher = Arc::new(
            MatrixPusher::new(
                &server.host_with_port(),
                Arc::clone(&ladder),
                cache.path().to_path_buf(),
            )
            .unwrap(),
        );

        (
            Arc::new(ShowController::new(tmi, downloader, pusher, queue, ladder)),
            cache,
        )
    }

    /// 入力スクリプトを流し、出力をまとめて返す
    async fn run_commands(show: Arc<ShowController>, input: &str) -> String {
        let reader = std::io::Cursor::new(input.as_bytes().to_vec());
        let mut writer = std::io::Cursor::new(Vec::new());
        handle_client(
            show,
            reader,
            &mut writer,
            "127.0.0.1".to_string(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        String::from_utf8(writer.into_inner()).unwrap()
    }

    #[test]
    fn test_interpret_backspace() {
        assert_eq!(interpret_backspace("pauze\u{8}e"), "pausee".to_string());
        assert_eq!(interpret_backspace("abc"), "abc");
        // 行頭のBSは何も消さない
        assert_eq!(interpret_backspace("\u{8}\u{8}on"), "on");
        assert_eq!(interpret_backspace("onn\u{8}"), "on");
    }

    #[tokio::test]
    async fn test_greeting_and_unknown_command() {
        let server = mockito::Server::new_async().await;
        let (show, _cache) = show_for(&server);

        let out = run_commands(show, "bogus\r\n").await;
        assert!(out.starts_with("Matrix Display Controller v"));
        assert!(out.contains("Hello 127.0.0.1!"));
        assert!(out.contains("Unknown command!\r\n"));
    }

    #[tokio::test]
    async fn test_commands_without_running_show() {
        let server = mockito::Server::new_async().await;
        let (show, _cache) = show_for(&server);

        let out = run_commands(
            show,
            "pause\r\nresume\r\noff\r\njoin :#somechannel\r\n",
        )
        .await;
        assert!(out.contains("Show is not running!.\r\n"));
        assert!(out.contains("Can't stop the show.\r\n"));
        assert!(out.contains("TMI is not ready.\r\n"));
    }

    #[tokio::test]
    async fn test_help_lists_commands() {
        let server = mockito::Server::new_async().await;
        let (show, _cache) = show_for(&server);

        let out = run_commands(show, "?\r\n").await;
        assert!(out.contains("** Command list **"));
        assert!(out.contains("| TELNET - "));
    }

    #[tokio::test]
    async fn test_telnet_mode_converts_line_breaks_and_backspace() {
        let server = mockito::Server::new_async().await;
        let (show, _cache) = show_for(&server);

        // telnet有効化後はメッセージ内部の改行もCR LFになり、BSが解釈される
        let out = run_commands(show, "telnet\r\nhellp\u{8}\u{8}\u{8}\u{8}\u{8}?\r\n").await;
        assert!(out.contains("CR LF line breaks\r\nBS is interpreted\r\n"));
        assert!(out.contains("** Command list **"));
    }

    #[tokio::test]
    async fn test_clear_command_hits_matrix() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/clear")
            .with_status(200)
            .create_async()
            .await;
        let (show, _cache) = show_for(&server);

        let out = run_commands(show, "clear\r\n").await;
        assert!(out.contains("Cleared matrix display.\r\n"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_case_insensitive_commands() {
        let server = mockito::Server::new_async().await;
        let (show, _cache) = show_for(&server);

        let out = run_commands(show, "PAUSE\r\n").await;
        assert!(out.contains("Show is not running!.\r\n"));
    }
}
