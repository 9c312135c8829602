//! IRCメッセージパーサー
//!
//! 1行のIRCメッセージを `@tags :prefix COMMAND params` に分解する。
//! すべて左から右への1パススキャンで、バックトラックしない。

use std::collections::HashMap;

/// パース済みIRCメッセージ
///
/// 各フィールドは存在した場合のみ設定される。1行から生成され不変。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrcMessage {
    /// IRCv3メッセージタグ（`@`を除いた生の文字列）
    pub tags: Option<String>,
    /// プレフィックス（`:`を除いた生の文字列）
    pub prefix: Option<String>,
    pub command: Option<String>,
    pub params: Option<String>,
}

/// プレフィックスの分解結果（必要時にのみ導出）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrcPrefix {
    pub name: Option<String>,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl IrcMessage {
    /// 1行をパースする
    pub fn parse(line: &str) -> Self {
        let mut parsed = Self::default();

        if line.len() < 2 {
            return parsed;
        }

        let mut rest = line;

        // IRCv3メッセージタグ（任意）
        let (tags, after) = take_header('@', rest);
        parsed.tags = tags;
        rest = after;
        if rest.is_empty() {
            return parsed;
        }

        // プレフィックス（任意）
        let (prefix, after) = take_header(':', rest);
        parsed.prefix = prefix;
        rest = after;
        if rest.is_empty() {
            return parsed;
        }

        // コマンドとパラメーター
        match rest.find(' ') {
            Some(i) => {
                parsed.command = Some(rest[..i].to_string());
                parsed.params = Some(rest[i + 1..].to_string());
            }
            None => {
                parsed.command = Some(rest.to_string());
            }
        }

        parsed
    }

    /// タグ文字列を連想マップへ分解する
    ///
    /// `;`区切り、各要素は最初の`=`でキーと値に分かれる。キーのない要素は捨てる。
    pub fn tag_map(tags: &str) -> HashMap<String, String> {
        tags.split(';')
            .filter(|s| !s.is_empty())
            .filter_map(|tag| {
                let (key, value) = match tag.split_once('=') {
                    Some((k, v)) => (k, v),
                    None => (tag, ""),
                };
                if key.is_empty() {
                    None
                } else {
                    Some((key.to_string(), value.to_string()))
                }
            })
            .collect()
    }
}

impl IrcPrefix {
    /// プレフィックスを右からスキャンして分解する
    ///
    /// 最後の`@`以降がhost、残りの最後の`!`以降がuser、残りがname。
    pub fn parse(prefix: &str) -> Self {
        let mut parsed = Self::default();

        if prefix.is_empty() {
            return parsed;
        }

        let mut end = prefix.len();
        if let Some(i) = prefix[..end].rfind('@') {
            parsed.host = Some(prefix[i + 1..end].to_string());
            end = i;
        }
        if let Some(i) = prefix[..end].rfind('!') {
            parsed.user = Some(prefix[i + 1..end].to_string());
            end = i;
        }
        parsed.name = Some(prefix[..end].to_string());

        parsed
    }
}

/// `key`で始まるヘッダーブロックを取り出す
///
/// 戻り値は（ヘッダー内容、残り）。次の空白が見つからなければ行末までを消費する。
fn take_header(key: char, s: &str) -> (Option<String>, &str) {
    if !s.starts_with(key) {
        return (None, s);
    }
    match s.find(' ') {
        Some(i) => (Some(s[1..i].to_string()), &s[i + 1..]),
        None => (Some(s[1..].to_string()), ""),
    }
}

/// パラメーター文字列をmiddleのリストとtrailingに分解する
///
/// `:`で始まるトークンが見つかった時点で残り全体（`:`以降そのまま）がtrailing。
/// 連続する空白はスキップする。trailingがなければ空文字列を返す。
pub fn parse_params(params: &str) -> (Vec<String>, String) {
    let mut middles = Vec::new();
    let bytes = params.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos] == b':' {
            return (middles, params[pos + 1..].to_string());
        }
        if bytes[pos] == b' ' {
            pos += 1;
            continue;
        }
        match params[pos..].find(' ') {
            Some(i) => {
                middles.push(params[pos..pos + i].to_string());
                pos += i + 1;
            }
            None => {
                middles.push(params[pos..].to_string());
                break;
            }
        }
    }

    (middles, String::new())
}
