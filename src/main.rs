// =============================================================================
// エントリーポイント
// =============================================================================
// CLI解析・ログ設定・コンポーネントの配線を行い、ショーを起動する
// =============================================================================

use std::collections::HashSet;
use std::io::Write;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{CommandFactory, Parser};
use tokio_util::sync::CancellationToken;

use matrix_display_ctrl::config::{BUILTIN_FORBIDDEN_EMOTES, CACHE_DIR_NAME, PRGM_VERSION};
use matrix_display_ctrl::control::CommandServer;
use matrix_display_ctrl::display::MatrixPusher;
use matrix_display_ctrl::downloader::{ImageDownloader, SharedLadder, SourceUrls};
use matrix_display_ctrl::extract::EmoteExtractor;
use matrix_display_ctrl::irc::TmiClient;
use matrix_display_ctrl::queue::EmoteQueue;
use matrix_display_ctrl::show::ShowController;

const LICENSE_PROMPT: &str = "\
Matrix Display Controller: connects the Matrix Reloaded LED panel display to Twitch chat
<https://github.com/toine512/matrix_reloaded_ctrl>
Copyright © 2023  toine512 <os@toine512.fr>

This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.

This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU Affero General Public License for more details. <https://www.gnu.org/licenses/>";

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "matrix-display-ctrl",
    version,
    about = "Connects the Matrix Reloaded LED panel display to Twitch chat",
    after_help = "Built-in forbidden Twitch emotes: MercyWing1, MercyWing2, PowerUpL, PowerUpR, Squid1, Squid2, Squid4"
)]
struct Cli {
    /// Required if standalone. Twitch Messaging Interface channel(s) to join.
    /// Format: <#chan>{,<#chan>{,...}}
    chan: Option<String>,

    /// Matrix display hostname or IP address to connect to.
    #[arg(long, default_value = "matrix-reloaded.local")]
    matrix_hostname: String,

    /// Defaults to INFO. Setting log level to DEBUG is suggested while
    /// experimenting. TRACE level prints IRC communications, which will
    /// expose credentials!
    #[arg(long, value_enum, ignore_case = true)]
    log_level: Option<LogLevel>,

    /// Only warnings and failures are output. Log level can still be set
    /// using --log-level.
    #[arg(short, long)]
    quiet: bool,

    /// No output.
    #[arg(short, long)]
    silent: bool,

    /// Comma-separated list of forbidden Twitch emote ids.
    #[arg(long, default_value = "")]
    forbidden_emotes: String,

    /// Comma-separated list of Twitch users to be ignored. Use this to
    /// ignore your bots.
    #[arg(long, default_value = "")]
    forbidden_users: String,

    /// Don't count repetitions of the same emote/emoji in A message.
    #[arg(short = 'u', long)]
    no_summation: bool,

    /// Don't do anything. Wait for commands on the command interface.
    /// --command-port is mandatory.
    #[arg(short = 'i', long)]
    interactive: bool,

    /// TCP port for the command interface. The command interface is
    /// disabled if this argument is not specified.
    #[arg(long)]
    command_port: Option<u16>,

    /// Shows license prompt and exits.
    #[arg(long)]
    license: bool,
}

fn comma_separated_list(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(str::to_string)
}

fn init_logging(cli: &Cli) {
    let level = if cli.silent {
        log::LevelFilter::Off
    } else {
        match cli.log_level {
            Some(level) => level.into(),
            None if cli.quiet => log::LevelFilter::Warn,
            None => log::LevelFilter::Info,
        }
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.license {
        println!("{}", LICENSE_PROMPT);
        return ExitCode::SUCCESS;
    }

    // 引数の整合性チェック
    let chan = cli.chan.clone().unwrap_or_default();
    if cli.interactive && cli.command_port.is_none() {
        Cli::command()
            .error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "--command-port must be specified with --interactive!",
            )
            .exit();
    }
    if cli.command_port == Some(0) {
        Cli::command()
            .error(clap::error::ErrorKind::InvalidValue, "Port value forbidden!")
            .exit();
    }
    if chan.is_empty() && cli.command_port.is_none() {
        Cli::command()
            .error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "A channel to join must be supplied when remote command interface is not enabled. \
                 Try --help to see the list of arguments and their explanation.",
            )
            .exit();
    }

    init_logging(&cli);

    // 禁止リスト（組み込み + CLI指定）
    let mut forbidden_ids: HashSet<String> = BUILTIN_FORBIDDEN_EMOTES
        .iter()
        .map(|(_, id)| id.to_string())
        .collect();
    forbidden_ids.extend(comma_separated_list(&cli.forbidden_emotes));
    let forbidden_nicks: HashSet<String> = comma_separated_list(&cli.forbidden_users)
        .map(|nick| nick.to_lowercase())
        .collect();

    // コンポーネントの配線
    let queue = Arc::new(EmoteQueue::new());
    let ladder = Arc::new(SharedLadder::new());
    let forbidden_ids = Arc::new(Mutex::new(forbidden_ids));
    let cache_dir = std::env::temp_dir().join(CACHE_DIR_NAME);

    let handler = Arc::new(EmoteExtractor::new(
        Arc::clone(&queue),
        cli.no_summation,
        forbidden_nicks,
        Arc::clone(&forbidden_ids),
    ));
    let tmi = Arc::new(TmiClient::new(&chan, "", "", handler));
    let downloader = match ImageDownloader::new(
        Arc::clone(&queue),
        forbidden_ids,
        Arc::clone(&ladder),
        SourceUrls::default(),
        cache_dir.clone(),
    ) {
        Ok(downloader) => Arc::new(downloader),
        Err(e) => {
            log::error!("Unable to initialise the image downloader: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let pusher = match MatrixPusher::new(&cli.matrix_hostname, Arc::clone(&ladder), cache_dir) {
        Ok(pusher) => Arc::new(pusher),
        Err(e) => {
            log::error!("Unable to initialise the display client: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let show = Arc::new(ShowController::new(tmi, downloader, pusher, queue, ladder));

    log::info!(
        "Matrix Display Controller\nversion {}\thttps://github.com/toine512/matrix_reloaded_ctrl",
        PRGM_VERSION
    );

    let root_cancel = CancellationToken::new();

    // コマンドインターフェース（任意）。バインド失敗は全体を止める。
    let command_task = cli.command_port.map(|port| {
        let server = CommandServer::new(port, Arc::clone(&show));
        let token = root_cancel.clone();
        let fail = root_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                log::error!("Program terminated! {}", e);
                fail.cancel();
            }
        })
    });

    // 対話モードでなければ即開始
    let standalone = cli.command_port.is_none();
    if !cli.interactive {
        show.start().await;
    }

    let mut exit_code = ExitCode::SUCCESS;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::debug!("User exit.");
        }
        _ = root_cancel.cancelled() => {
            exit_code = ExitCode::FAILURE;
        }
        _ = wait_show_failure(&show, standalone) => {
            // スタンドアロンではショーの停止がプログラムの終了を意味する
            exit_code = ExitCode::FAILURE;
        }
    }

    // 後始末: ショーを止めてからコマンドインターフェースを閉じる
    show.stop().await;
    root_cancel.cancel();
    if let Some(task) = command_task {
        let _ = task.await;
    }

    exit_code
}

/// スタンドアロン構成でショーが自壊したことを検出する
///
/// コマンドインターフェースがある構成ではオペレーターが再開できるため
/// 監視しない（永久に待つ）。
async fn wait_show_failure(show: &ShowController, standalone: bool) {
    if !standalone {
        std::future::pending::<()>().await;
    }
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if !show.is_running().await {
            return;
        }
    }
}
