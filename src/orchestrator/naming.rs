//! リソース名の生成
//!
//! テナントが入力したサーバー名から、Kubernetesの命名規則（RFC 1123）に
//! 準拠したリソース名・ラベル値を導出します。入力は拒否せず、常に変換します。

use std::collections::BTreeMap;

/// リソース名の最大長
pub const MAX_RESOURCE_NAME_LEN: usize = 253;

/// ラベル値・Service名の最大長
pub const MAX_LABEL_VALUE_LEN: usize = 63;

const DEPLOYMENT_PREFIX: &str = "mcp-";

/// RFC 1123 サブドメイン形式へ変換
///
/// 小文字化、空白を`-`へ置換、`[a-z0-9.-]`以外を除去、連続する`-`と`.`を
/// 1文字に縮約し、先頭・末尾の英数字以外を取り除きます。
pub fn rfc1123(input: &str) -> String {
    let mut out = String::with_capacity(input.len());

    for ch in input.to_lowercase().chars() {
        let mapped = if ch.is_whitespace() { '-' } else { ch };
        if !(mapped.is_ascii_lowercase() || mapped.is_ascii_digit() || mapped == '-' || mapped == '.')
        {
            continue;
        }
        // 連続する区切り文字を縮約
        if (mapped == '-' || mapped == '.') && out.ends_with(mapped) {
            continue;
        }
        out.push(mapped);
    }

    trim_non_alphanumeric(&out).to_string()
}

/// Deployment名: `mcp-` + RFC 1123 変換したサーバー名（最大253文字）
pub fn deployment_name(server_name: &str) -> String {
    let sanitized = rfc1123(server_name);
    let body = truncate(&sanitized, MAX_RESOURCE_NAME_LEN - DEPLOYMENT_PREFIX.len());
    format!(
        "{}{}",
        DEPLOYMENT_PREFIX,
        body.trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
    )
}

/// Secret名: `mcp-server-{id}-secrets`
pub fn secret_name(server_id: &str) -> String {
    format!("mcp-server-{}-secrets", server_id)
}

/// Service名（DNS-1035 ラベル、最大63文字、`.`は使用不可）
pub fn service_name(server_name: &str) -> String {
    let mut name = String::new();
    for ch in deployment_name(server_name).chars() {
        let mapped = if ch == '.' { '-' } else { ch };
        if mapped == '-' && name.ends_with('-') {
            continue;
        }
        name.push(mapped);
    }
    truncate(&name, MAX_LABEL_VALUE_LEN)
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// ラベル値（最大63文字、末尾は英数字）
pub fn label_value(input: &str) -> String {
    let sanitized = rfc1123(input);
    truncate(&sanitized, MAX_LABEL_VALUE_LEN)
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// ラベルマップ全体をサニタイズ
pub fn sanitize_labels<'a, I>(labels: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    labels
        .into_iter()
        .map(|(key, value)| (rfc1123(key), label_value(value)))
        .collect()
}

fn trim_non_alphanumeric(s: &str) -> &str {
    s.trim_matches(|c: char| !c.is_ascii_alphanumeric())
}

// 変換後はASCIIのみなので文字数＝バイト数
fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
