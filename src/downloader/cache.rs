//! キャッシュファイル名ヘルパー
//!
//! `<kind>_<id>` からファイルシステムで安全な名前を作る。

/// 名前をキャッシュファイル名向けにサニタイズする
///
/// 英数字と `_` `.` `-` のみ残し、空白は `_` に置き換える。
/// 空文字列や予約名（`.` `..`）になった場合は`None`。
pub fn sanitize_filename(name: &str) -> Option<String> {
    let cleaned: String = name
        .trim()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        None
    } else {
        Some(cleaned)
    }
}
