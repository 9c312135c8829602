//! TMIクライアント
//!
//! Twitch Messaging Interface への接続状態機械。
//! 接続 → CAPネゴシエーション → 認証 → 定常読み取りループを管理し、
//! 切断時は5分のバックオフで無限に再接続する。
//!
//! PRIVMSGの処理は注入された[`ChatHandler`]に委譲する。抽出ロジックを
//! 差し替えられるようにするための接合点で、状態機械側は中身を知らない。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::errors::IrcError;
use super::framing::LineReader;
use super::message::{parse_params, IrcMessage, IrcPrefix};
use crate::config::{AUTH_TIMEOUT, CAP_TIMEOUT, RECONNECT_BACKOFF, TMI_HOST, TMI_PORT};

/// PRIVMSG処理の注入先
pub trait ChatHandler: Send + Sync {
    fn handle_privmsg(&self, msg: &IrcMessage);
}

/// TMI接続クライアント
pub struct TmiClient {
    channel: String,
    nick: String,
    pass: String,
    handler: Arc<dyn ChatHandler>,
    /// 認証完了後にtrue。JOIN要求のガードに使う。
    available: AtomicBool,
    join_tx: mpsc::UnboundedSender<String>,
    /// 受信側は実行中のセッションが占有する
    join_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl TmiClient {
    /// 新しいクライアントを作成
    ///
    /// `user`と`token`が空の場合は匿名認証（justinfan）で接続する。
    pub fn new(channel: &str, user: &str, token: &str, handler: Arc<dyn ChatHandler>) -> Self {
        let nick = {
            let user = user.trim().to_lowercase();
            if user.is_empty() {
                format!("justinfan{}", rand::random::<u32>())
            } else {
                user
            }
        };
        let pass = if token.is_empty() {
            "ILikeTrains!".to_string()
        } else {
            format!("oauth:{}", token)
        };
        let (join_tx, join_rx) = mpsc::unbounded_channel();

        Self {
            channel: channel.trim().to_lowercase(),
            nick,
            pass,
            handler,
            available: AtomicBool::new(false),
            join_tx,
            join_rx: tokio::sync::Mutex::new(join_rx),
        }
    }

    /// 認証済みかどうか
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// チャンネルJOINを接続タスクへ依頼する
    ///
    /// 空文字列や未認証時は何もせずfalseを返す。
    pub fn request_join(&self, channels: &str) -> bool {
        if channels.is_empty() || !self.is_available() {
            return false;
        }
        self.join_tx.send(channels.to_string()).is_ok()
    }

    /// 接続タスク本体（再接続ループ）
    ///
    /// キャンセルで`Ok(())`を返す。設定起因の致命的エラー
    /// （CAP拒否・認証失敗）は再試行せず`Err`で抜ける。
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), IrcError> {
        let mut join_rx = self.join_rx.lock().await;

        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.connect() => res,
            };

            match stream {
                Err(e) => {
                    log::error!(
                        "TMI: can't connect to Twitch Messaging Interface: {}. Retry in 5 minutes.",
                        e
                    );
                }
                Ok(stream) => {
                    let (read_half, write_half) = tokio::io::split(stream);
                    let mut reader = LineReader::new(read_half);
                    let mut writer = write_half;

                    let res = self
                        .session(&mut reader, &mut writer, &mut join_rx, &cancel)
                        .await;
                    self.available.store(false, Ordering::SeqCst);
                    let _ = writer.shutdown().await;

                    match res {
                        Ok(()) => return Ok(()), // キャンセルされた
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            log::error!("TMI: connection error: {}. Retry in 5 minutes.", e);
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
        }
    }

    async fn connect(&self) -> Result<tokio_native_tls::TlsStream<TcpStream>, IrcError> {
        let tcp = TcpStream::connect((TMI_HOST, TMI_PORT)).await?;
        let connector = tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
        let tls = connector
            .connect(TMI_HOST, tcp)
            .await
            .map_err(|e| IrcError::Protocol(format!("TLS handshake failed: {}", e)))?;
        Ok(tls)
    }

    /// 1接続分のセットアップと定常ループ
    ///
    /// キャンセル時はベストエフォートでQUITを送って`Ok(())`。
    /// 切断・タイムアウトは`Err(Io)`で呼び出し元が再接続する。
    async fn session<R, W>(
        &self,
        reader: &mut LineReader<R>,
        writer: &mut W,
        join_rx: &mut mpsc::UnboundedReceiver<String>,
        cancel: &CancellationToken,
    ) -> Result<(), IrcError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut deferred: Vec<IrcMessage> = Vec::new();

        // CAPネゴシエーションと認証。どちらも待機中の無関係なメッセージは
        // 順序を保って退避し、セットアップ完了後に通常処理へ流す。
        timeout(CAP_TIMEOUT, self.negotiate_caps(reader, writer, &mut deferred))
            .await
            .map_err(elapsed_to_io)??;
        timeout(AUTH_TIMEOUT, self.authenticate(reader, writer, &mut deferred))
            .await
            .map_err(elapsed_to_io)??;

        self.available.store(true, Ordering::SeqCst);

        // 設定されたチャンネルへJOIN（空なら黙ってスキップ）
        if !self.channel.is_empty() {
            self.send_join(writer, &self.channel).await?;
        }

        // 退避メッセージを元の順序で処理
        for msg in deferred.drain(..) {
            self.dispatch(writer, &msg).await?;
        }

        // 定常読み取りループ
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.send_quit(writer, "Goodbye.").await;
                    return Ok(());
                }
                req = join_rx.recv() => {
                    if let Some(channels) = req {
                        self.send_join(writer, &channels).await?;
                    }
                }
                line = reader.next_line() => {
                    match line? {
                        Some(line) => self.dispatch(writer, &IrcMessage::parse(&line)).await?,
                        None => {
                            return Err(IrcError::Io(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "TMI connection closed",
                            )));
                        }
                    }
                }
            }
        }
    }

    /// CAP REQを送り、ACK/NAKを解釈する
    async fn negotiate_caps<R, W>(
        &self,
        reader: &mut LineReader<R>,
        writer: &mut W,
        deferred: &mut Vec<IrcMessage>,
    ) -> Result<(), IrcError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        send_line(writer, "CAP REQ :twitch.tv/tags").await?;

        loop {
            let line = match reader.next_line().await? {
                Some(line) => line,
                None => return Err(unexpected_eof()),
            };
            let msg = IrcMessage::parse(&line);
            match msg.command.as_deref() {
                None => {}
                Some("CAP") => {
                    let (middles, caps) = parse_params(msg.params.as_deref().unwrap_or(""));
                    return match middles.get(1).map(String::as_str) {
                        Some("ACK") => {
                            log::debug!("TMI: granted capabilities: {}", caps);
                            Ok(())
                        }
                        Some("NAK") => {
                            log::error!("TMI: refused capabilities: {}", caps);
                            Err(IrcError::CapabilitiesRefused(caps))
                        }
                        _ => Err(IrcError::Protocol(format!(
                            "unrecognised CAP REQ response: {}",
                            line
                        ))),
                    };
                }
                Some(_) => deferred.push(msg),
            }
        }
    }

    /// PASS/NICKを送り、376（プリアンブル終端）を待つ
    async fn authenticate<R, W>(
        &self,
        reader: &mut LineReader<R>,
        writer: &mut W,
        deferred: &mut Vec<IrcMessage>,
    ) -> Result<(), IrcError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        send_line(writer, &format!("PASS {}", self.pass)).await?;
        send_line(writer, &format!("NICK {}", self.nick)).await?;

        loop {
            let line = match reader.next_line().await? {
                Some(line) => line,
                None => return Err(unexpected_eof()),
            };
            let msg = IrcMessage::parse(&line);
            match msg.command.as_deref() {
                None => {}
                Some("376") => {
                    log::info!("TMI: authentication successful.");
                    return Ok(());
                }
                Some("NOTICE") => match msg.params.as_deref() {
                    Some("* :Login authentication failed") => {
                        self.send_quit(writer, "Can't authenticate, aborting.").await;
                        return Err(IrcError::AuthenticationFailed);
                    }
                    Some("* :Improperly formatted auth") => {
                        self.send_quit(writer, "Can't authenticate, aborting.").await;
                        return Err(IrcError::Protocol(
                            "TMI \"Improperly formatted auth\"".to_string(),
                        ));
                    }
                    _ => deferred.push(msg),
                },
                Some(_) => deferred.push(msg),
            }
        }
    }

    /// 受信メッセージのディスパッチ
    async fn dispatch<W>(&self, writer: &mut W, msg: &IrcMessage) -> Result<(), IrcError>
    where
        W: AsyncWrite + Unpin,
    {
        match msg.command.as_deref() {
            Some("PING") => {
                send_line(
                    writer,
                    &format!("PONG {}", msg.params.as_deref().unwrap_or("")),
                )
                .await?;
            }
            Some("PRIVMSG") => self.handler.handle_privmsg(msg),
            Some("JOIN") => {
                if let Some(chan) = self.own_channel_event(msg) {
                    log::info!("TMI: successfully joined {} as {}!", chan, self.nick);
                }
            }
            Some("PART") => {
                if let Some(chan) = self.own_channel_event(msg) {
                    log::error!("TMI: got kicked out of {}! ({})", chan, self.nick);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// 自分のnickに関するJOIN/PART通知ならチャンネル名を返す
    fn own_channel_event(&self, msg: &IrcMessage) -> Option<String> {
        let prefix = msg.prefix.as_deref()?;
        let chan = msg.params.as_deref()?;
        if IrcPrefix::parse(prefix).name.as_deref() == Some(self.nick.as_str())
            && chan.starts_with('#')
        {
            Some(chan.to_string())
        } else {
            None
        }
    }

    async fn send_join<W>(&self, writer: &mut W, channels: &str) -> Result<(), IrcError>
    where
        W: AsyncWrite + Unpin,
    {
        send_line(writer, &format!("JOIN {}", channels)).await
    }

    /// ベストエフォートでQUITを送る（失敗は無視）
    async fn send_quit<W>(&self, writer: &mut W, message: &str)
    where
        W: AsyncWrite + Unpin,
    {
        let _ = send_line(writer, &format!("QUIT {}", message)).await;
        log::info!("IRC Quit: {}", message);
    }
}

async fn send_line<W>(writer: &mut W, line: &str) -> Result<(), IrcError>
where
    W: AsyncWrite + Unpin,
{
    log::trace!("IRC Send: {}", line.escape_debug());
    writer.write_all(format!("{}\r\n", line).as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn elapsed_to_io(_: tokio::time::error::Elapsed) -> IrcError {
    IrcError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "TMI setup phase timed out",
    ))
}

fn unexpected_eof() -> IrcError {
    IrcError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "TMI connection closed during setup",
    ))
}
