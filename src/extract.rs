//! エモート・絵文字抽出パイプライン
//!
//! PRIVMSGからTwitchエモート（IRCv3タグ経由）とUnicode絵文字クラスター
//! （本文走査）を数え上げ、作業キューへ投入する。
//! [`ChatHandler`]実装としてTMIクライアントへ注入される。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use linked_hash_map::LinkedHashMap;
use unicode_segmentation::UnicodeSegmentation;

use crate::irc::{parse_params, ChatHandler, IrcMessage, IrcPrefix};
use crate::queue::{EmoteItem, EmoteKind, EmoteQueue};

/// 絵文字の表示指定子（presentation selector）
const VARIATION_SELECTORS: [char; 2] = ['\u{fe0e}', '\u{fe0f}'];

/// ゼロ幅接合子
const ZWJ: char = '\u{200d}';

/// PRIVMSG本文からのエモート抽出器
pub struct EmoteExtractor {
    queue: Arc<EmoteQueue>,
    /// trueなら同一メッセージ内の繰り返しを数えない（常にcount=1）
    no_summation: bool,
    forbidden_nicks: HashSet<String>,
    /// ダウンローダーと共有する禁止IDセット（実行中に増える）
    forbidden_ids: Arc<Mutex<HashSet<String>>>,
}

impl EmoteExtractor {
    pub fn new(
        queue: Arc<EmoteQueue>,
        no_summation: bool,
        forbidden_nicks: HashSet<String>,
        forbidden_ids: Arc<Mutex<HashSet<String>>>,
    ) -> Self {
        Self {
            queue,
            no_summation,
            forbidden_nicks,
            forbidden_ids,
        }
    }

    /// Twitchエモートタグ（`id:ranges/id:ranges/...`）を処理する
    fn process_emote_tag(&self, spec: &str) {
        let forbidden = self.forbidden_ids.lock().unwrap();
        for entry in spec.split('/') {
            let (id, ranges) = match entry.split_once(':') {
                Some((id, ranges)) => (id, ranges),
                None => (entry, ""),
            };
            if id.is_empty() || ranges.is_empty() || forbidden.contains(id) {
                continue;
            }
            let count = if self.no_summation {
                1
            } else {
                ranges.matches(',').count() as u64 + 1
            };
            self.queue.push(EmoteItem::new(EmoteKind::Twitch, id, count));
        }
    }

    /// 本文から絵文字クラスターを抽出して投入する
    fn process_text(&self, text: &str) {
        let forbidden = self.forbidden_ids.lock().unwrap();
        for (cluster, count) in extract_emojis(text, self.no_summation) {
            let key = codepoints_key(&cluster);
            if !forbidden.contains(&key) {
                self.queue.push(EmoteItem::new(EmoteKind::Emoji, key, count));
            }
        }
    }
}

impl ChatHandler for EmoteExtractor {
    fn handle_privmsg(&self, msg: &IrcMessage) {
        // 送信者のnickを導出。空のnickや無視対象は走査しない。
        let nick = match msg.prefix.as_deref() {
            Some(prefix) => IrcPrefix::parse(prefix).name.unwrap_or_default(),
            None => return,
        };
        if nick.is_empty() || self.forbidden_nicks.contains(&nick) {
            return;
        }

        let mut skip_content = false;

        if let Some(tags) = msg.tags.as_deref() {
            let tags = IrcMessage::tag_map(tags);
            if let Some(spec) = tags.get("emotes") {
                if !spec.is_empty() {
                    self.process_emote_tag(spec);
                    // エモートのみのメッセージなら本文走査は不要
                    skip_content = tags.get("emote-only").map(String::as_str) == Some("1");
                }
            }
        }

        if !skip_content {
            let (_, text) = parse_params(msg.params.as_deref().unwrap_or(""));
            self.process_text(&text);
        }
    }
}

/// 本文から絵文字クラスターを出現順に数え上げる
///
/// `only_once`がtrueの場合は重複を除きcountを1に固定する。
pub fn extract_emojis(text: &str, only_once: bool) -> Vec<(String, u64)> {
    let mut counts: LinkedHashMap<String, u64> = LinkedHashMap::new();
    for cluster in text.graphemes(true) {
        if let Some(normalized) = normalize_emoji_cluster(cluster) {
            *counts.entry(normalized).or_insert(0) += 1;
        }
    }

    if only_once {
        counts.into_iter().map(|(cluster, _)| (cluster, 1)).collect()
    } else {
        counts.into_iter().collect()
    }
}

/// 書記素クラスターが絵文字なら正規化して返す
///
/// ZWJを含まない場合のみ末尾の表示指定子を1つ取り除く。
/// 複数コードポイントのZWJシーケンスは分解せずそのまま保つ。
fn normalize_emoji_cluster(cluster: &str) -> Option<String> {
    let normalized = if cluster.contains(ZWJ) {
        cluster
    } else {
        let mut chars = cluster.chars();
        match chars.next_back() {
            Some(last) if VARIATION_SELECTORS.contains(&last) => chars.as_str(),
            _ => cluster,
        }
    };

    if normalized.is_empty() {
        return None;
    }
    // 絵文字データベースと照合。指定子を落とした形が未収録のものは
    // 元のクラスターでも引き当てを試みる。
    if emojis::get(cluster).is_some() || emojis::get(normalized).is_some() {
        Some(normalized.to_string())
    } else {
        None
    }
}

/// クラスターをコードポイントの小文字16進表記（`-`区切り）にする
pub fn codepoints_key(cluster: &str) -> String {
    cluster
        .chars()
        .map(|c| format!("{:x}", c as u32))
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(no_summation: bool) -> (Arc<EmoteQueue>, EmoteExtractor) {
        let queue = Arc::new(EmoteQueue::new());
        let ex = EmoteExtractor::new(
            Arc::clone(&queue),
            no_summation,
            HashSet::from(["ignored_bot".to_string()]),
            Arc::new(Mutex::new(HashSet::from(["666".to_string()]))),
        );
        (queue, ex)
    }

    fn drain(queue: &EmoteQueue) -> Vec<EmoteItem> {
        let mut items = Vec::new();
        while let Some(item) = queue.try_pop() {
            items.push(item);
        }
        items
    }

    #[test]
    fn test_emote_tag_with_summation() {
        let (queue, ex) = extractor(false);
        let msg = IrcMessage::parse(
            "@emotes=25:0-4,6-10;emote-only=0 :ninja!ninja@host PRIVMSG #c :Kappa Kappa",
        );
        ex.handle_privmsg(&msg);

        let items = drain(&queue);
        assert_eq!(items, vec![EmoteItem::new(EmoteKind::Twitch, "25", 2)]);
    }

    #[test]
    fn test_emote_tag_no_summation() {
        let (queue, ex) = extractor(true);
        let msg = IrcMessage::parse(
            "@emotes=25:0-4,6-10 :ninja!ninja@host PRIVMSG #c :Kappa Kappa",
        );
        ex.handle_privmsg(&msg);

        let items = drain(&queue);
        assert_eq!(items, vec![EmoteItem::new(EmoteKind::Twitch, "25", 1)]);
    }

    #[test]
    fn test_emote_only_suppresses_text_scan() {
        let (queue, ex) = extractor(false);
        let msg = IrcMessage::parse(
            "@emotes=25:0-4;emote-only=1 :ninja!ninja@host PRIVMSG #c :Kappa 😀",
        );
        ex.handle_privmsg(&msg);

        let items = drain(&queue);
        assert_eq!(items, vec![EmoteItem::new(EmoteKind::Twitch, "25", 1)]);
    }

    #[test]
    fn test_emoji_extraction_counts() {
        let (queue, ex) = extractor(false);
        let msg = IrcMessage::parse(":ninja!ninja@host PRIVMSG #c :Hello 😀😀 world");
        ex.handle_privmsg(&msg);

        let items = drain(&queue);
        assert_eq!(items, vec![EmoteItem::new(EmoteKind::Emoji, "1f600", 2)]);
    }

    #[test]
    fn test_emoji_extraction_no_summation() {
        let (queue, ex) = extractor(true);
        let msg = IrcMessage::parse(":ninja!ninja@host PRIVMSG #c :Hello 😀😀 world");
        ex.handle_privmsg(&msg);

        let items = drain(&queue);
        assert_eq!(items, vec![EmoteItem::new(EmoteKind::Emoji, "1f600", 1)]);
    }

    #[test]
    fn test_forbidden_nick_is_ignored() {
        let (queue, ex) = extractor(false);
        let msg = IrcMessage::parse(":ignored_bot!b@host PRIVMSG #c :😀");
        ex.handle_privmsg(&msg);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_missing_prefix_is_ignored() {
        let (queue, ex) = extractor(false);
        let msg = IrcMessage::parse("PRIVMSG #c :😀");
        ex.handle_privmsg(&msg);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_forbidden_emote_id_is_skipped() {
        let (queue, ex) = extractor(false);
        let msg = IrcMessage::parse("@emotes=666:0-4/25:6-10 :n!n@h PRIVMSG #c :x y");
        ex.handle_privmsg(&msg);

        let items = drain(&queue);
        assert_eq!(items, vec![EmoteItem::new(EmoteKind::Twitch, "25", 1)]);
    }

    #[test]
    fn test_presentation_selector_stripped() {
        // 基底コードポイント + FE0F（ZWJなし）は基底のみで表記する
        let emojis = extract_emojis("\u{263a}\u{fe0f}", false);
        assert_eq!(emojis.len(), 1);
        assert_eq!(codepoints_key(&emojis[0].0), "263a");
    }

    #[test]
    fn test_zwj_sequence_stays_intact() {
        let emojis = extract_emojis("👨\u{200d}👩\u{200d}👧", false);
        assert_eq!(emojis.len(), 1);
        assert_eq!(
            codepoints_key(&emojis[0].0),
            "1f468-200d-1f469-200d-1f467"
        );
    }

    #[test]
    fn test_plain_text_yields_nothing() {
        assert!(extract_emojis("just words, no pictures 123", false).is_empty());
    }

    #[test]
    fn test_emoji_order_is_first_seen() {
        let found = extract_emojis("😀🎉😀🚀", false);
        let keys: Vec<_> = found.iter().map(|(c, n)| (codepoints_key(c), *n)).collect();
        assert_eq!(
            keys,
            vec![
                ("1f600".to_string(), 2),
                ("1f389".to_string(), 1),
                ("1f680".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_codepoints_key_format() {
        assert_eq!(codepoints_key("😀"), "1f600");
        assert_eq!(codepoints_key("a"), "61");
    }
}
