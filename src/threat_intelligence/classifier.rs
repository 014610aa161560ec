//! Keyword Rule Tables
//!
//! キーワード（部分文字列）による脅威種別・ブランド推定。
//! ルールは上から順に評価され、最初に一致したラベルを返す。どれにも一致しなければデフォルト値。
//! 精度はあくまで近似なので、TOMLファイルから差し替えられるようにデータとして保持する。

use crate::threat_intelligence::types::ThreatKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 1件のキーワードルール
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRule<L> {
    /// 部分一致パターン（大文字小文字は区別しない）
    pub pattern: String,
    /// 一致時のラベル
    pub label: L,
    /// 英数字に隣接する一致を除外する（`rat` が `operation` に一致しないように）
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub whole_word: bool,
}

impl<L> KeywordRule<L> {
    pub fn new(pattern: impl Into<String>, label: L) -> Self {
        Self {
            pattern: pattern.into().to_lowercase(),
            label,
            whole_word: false,
        }
    }

    /// 単語単位で一致するルール
    pub fn word(pattern: impl Into<String>, label: L) -> Self {
        Self {
            whole_word: true,
            ..Self::new(pattern, label)
        }
    }

    /// 小文字化済みのテキストに一致するか
    fn matches(&self, haystack: &str) -> bool {
        if self.pattern.is_empty() {
            return false;
        }
        if !self.whole_word {
            return haystack.contains(&self.pattern);
        }

        haystack.match_indices(&self.pattern).any(|(start, found)| {
            let before = haystack[..start].chars().next_back();
            let after = haystack[start + found.len()..].chars().next();
            !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
        })
    }
}

/// 順序付きルールテーブル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTable<L> {
    pub rules: Vec<KeywordRule<L>>,
    pub default: L,
}

impl<L: Clone> RuleTable<L> {
    pub fn new(rules: Vec<KeywordRule<L>>, default: L) -> Self {
        let rules = rules
            .into_iter()
            .map(|mut rule| {
                rule.pattern = rule.pattern.to_lowercase();
                rule
            })
            .collect();
        Self { rules, default }
    }

    /// パターンの長い順に並べ替える（ブランド表のような最長一致用）
    pub fn longest_first(mut self) -> Self {
        self.rules
            .sort_by(|a, b| b.pattern.len().cmp(&a.pattern.len()));
        self
    }

    /// 最初に一致したルールのラベル
    pub fn find(&self, text: &str) -> Option<&L> {
        let haystack = text.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&haystack))
            .map(|rule| &rule.label)
    }

    /// 一致しなければデフォルト値
    pub fn classify(&self, text: &str) -> L {
        self.find(text).cloned().unwrap_or_else(|| self.default.clone())
    }

    /// 複数テキストのうち最初に一致したもの（テキスト順）
    pub fn find_any<'a, I>(&self, texts: I) -> Option<&L>
    where
        I: IntoIterator<Item = &'a str>,
    {
        texts.into_iter().find_map(|text| self.find(text))
    }
}

/// 全プロバイダーで共有するルール集
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleBook {
    /// URLhaus の threat 列
    pub threat_labels: RuleTable<ThreatKind>,
    /// OTX パルスのタグ・マルウェアファミリー
    pub pulse_tags: RuleTable<ThreatKind>,
    /// URL/ドメインから推定するなりすましブランド
    pub brands: RuleTable<String>,
}

impl Default for RuleBook {
    fn default() -> Self {
        Self {
            threat_labels: default_threat_label_rules(),
            pulse_tags: default_pulse_tag_rules(),
            brands: default_brand_rules(),
        }
    }
}

impl RuleBook {
    /// TOMLファイルから読み込む（未指定のテーブルはデフォルト）
    pub fn from_toml_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let book: RuleBook = toml::from_str(content)?;
        Ok(book.normalized())
    }

    fn normalized(self) -> Self {
        Self {
            threat_labels: RuleTable::new(self.threat_labels.rules, self.threat_labels.default),
            pulse_tags: RuleTable::new(self.pulse_tags.rules, self.pulse_tags.default),
            brands: RuleTable::new(self.brands.rules, self.brands.default).longest_first(),
        }
    }

    /// URL/ドメインからブランドを推定
    pub fn brand_for(&self, text: &str) -> String {
        self.brands.classify(text)
    }

    /// フィッシング指標の説明文を生成
    pub fn phishing_description(&self, text: &str) -> String {
        format!("Phishing site targeting {}", self.brand_for(text))
    }
}

fn default_threat_label_rules() -> RuleTable<ThreatKind> {
    RuleTable::new(
        vec![
            KeywordRule::new("phish", ThreatKind::Phishing),
            KeywordRule::new("botnet_cc", ThreatKind::CommandAndControl),
            KeywordRule::new("c2", ThreatKind::CommandAndControl),
            KeywordRule::new("trojan", ThreatKind::Malware),
            KeywordRule::new("backdoor", ThreatKind::Malware),
            KeywordRule::new("spam", ThreatKind::Spam),
            KeywordRule::word("rat", ThreatKind::Malware),
        ],
        ThreatKind::Malware,
    )
}

fn default_pulse_tag_rules() -> RuleTable<ThreatKind> {
    RuleTable::new(
        vec![
            KeywordRule::new("phish", ThreatKind::Phishing),
            KeywordRule::new("credential harvest", ThreatKind::Phishing),
            KeywordRule::new("command and control", ThreatKind::CommandAndControl),
            KeywordRule::new("c&c", ThreatKind::CommandAndControl),
            KeywordRule::new("c2", ThreatKind::CommandAndControl),
            KeywordRule::new("botnet", ThreatKind::CommandAndControl),
            KeywordRule::new("spam", ThreatKind::Spam),
            KeywordRule::new("ransomware", ThreatKind::Malware),
            KeywordRule::new("trojan", ThreatKind::Malware),
            KeywordRule::new("backdoor", ThreatKind::Malware),
            KeywordRule::new("stealer", ThreatKind::Malware),
            KeywordRule::new("loader", ThreatKind::Malware),
            KeywordRule::new("malware", ThreatKind::Malware),
            KeywordRule::word("rat", ThreatKind::Malware),
        ],
        ThreatKind::Unknown,
    )
}

fn default_brand_rules() -> RuleTable<String> {
    let brands: [(&str, &str); 32] = [
        ("paypal", "PayPal"),
        ("apple", "Apple"),
        ("icloud", "Apple"),
        ("microsoft", "Microsoft"),
        ("office365", "Microsoft"),
        ("outlook", "Microsoft"),
        ("onedrive", "Microsoft"),
        ("sharepoint", "Microsoft"),
        ("google", "Google"),
        ("gmail", "Google"),
        ("amazon", "Amazon"),
        ("netflix", "Netflix"),
        ("facebook", "Facebook"),
        ("instagram", "Instagram"),
        ("whatsapp", "WhatsApp"),
        ("linkedin", "LinkedIn"),
        ("dropbox", "Dropbox"),
        ("docusign", "DocuSign"),
        ("adobe", "Adobe"),
        ("wellsfargo", "Wells Fargo"),
        ("wells-fargo", "Wells Fargo"),
        ("chase", "Chase"),
        ("bankofamerica", "Bank of America"),
        ("coinbase", "Coinbase"),
        ("binance", "Binance"),
        ("metamask", "MetaMask"),
        ("steamcommunity", "Steam"),
        ("dhl", "DHL"),
        ("fedex", "FedEx"),
        ("usps", "USPS"),
        ("ebay", "eBay"),
        ("telegram", "Telegram"),
    ];

    RuleTable::new(
        brands
            .iter()
            .map(|(pattern, label)| KeywordRule::new(*pattern, label.to_string()))
            .collect(),
        "unknown service".to_string(),
    )
    .longest_first()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threat_labels_first_match_wins() {
        let book = RuleBook::default();
        assert_eq!(book.threat_labels.classify("phishing"), ThreatKind::Phishing);
        assert_eq!(
            book.threat_labels.classify("botnet_cc"),
            ThreatKind::CommandAndControl
        );
        assert_eq!(book.threat_labels.classify("Trojan.Agent"), ThreatKind::Malware);
        assert_eq!(book.threat_labels.classify("malware_download"), ThreatKind::Malware);
        assert_eq!(book.threat_labels.classify(""), ThreatKind::Malware);
    }

    #[test]
    fn test_pulse_tags_default_unknown() {
        let book = RuleBook::default();
        assert_eq!(book.pulse_tags.classify("apt"), ThreatKind::Unknown);
        assert_eq!(
            book.pulse_tags.find_any(["apt", "Phishing Kit"]),
            Some(&ThreatKind::Phishing)
        );
        assert_eq!(book.pulse_tags.find_any(["apt", "cve"]), None);
    }

    #[test]
    fn test_whole_word_rule_ignores_embedded_matches() {
        let book = RuleBook::default();
        assert_eq!(book.pulse_tags.classify("Operation Dream Job"), ThreatKind::Unknown);
        assert_eq!(book.pulse_tags.classify("corporate espionage"), ThreatKind::Unknown);
        assert_eq!(book.pulse_tags.classify("Remcos RAT"), ThreatKind::Malware);
        assert_eq!(book.pulse_tags.classify("rat_dropper"), ThreatKind::Malware);
        assert_eq!(
            book.pulse_tags.find_any(["Operation X", "generated"]),
            None
        );
    }

    #[test]
    fn test_brand_longest_match() {
        let table = RuleTable::new(
            vec![
                KeywordRule::new("apple", "Apple".to_string()),
                KeywordRule::new("applepay", "Apple Pay".to_string()),
            ],
            "unknown service".to_string(),
        )
        .longest_first();

        assert_eq!(table.classify("https://applepay-verify.example"), "Apple Pay");
        assert_eq!(table.classify("https://apple-id.example"), "Apple");
        assert_eq!(table.classify("https://example.org"), "unknown service");
    }

    #[test]
    fn test_phishing_description() {
        let book = RuleBook::default();
        assert_eq!(
            book.phishing_description("https://secure-PayPal.example/login"),
            "Phishing site targeting PayPal"
        );
        assert_eq!(
            book.phishing_description("https://example.org"),
            "Phishing site targeting unknown service"
        );
    }

    #[test]
    fn test_rule_book_from_toml_overrides_one_table() {
        let content = r#"
            [brands]
            default = "some brand"

            [[brands.rules]]
            pattern = "ACME"
            label = "Acme Corp"

            [[brands.rules]]
            pattern = "ups"
            label = "UPS"
            whole_word = true
        "#;

        let book = RuleBook::from_toml_str(content).unwrap();
        assert_eq!(book.brand_for("https://acme-login.example"), "Acme Corp");
        assert_eq!(book.brand_for("https://paypal.example"), "some brand");
        assert_eq!(book.brand_for("https://ups.example/track"), "UPS");
        assert_eq!(book.brand_for("https://groups.example"), "some brand");
        // 未指定のテーブルはデフォルトのまま
        assert_eq!(book.threat_labels, RuleBook::default().threat_labels);
    }

    #[test]
    fn test_rule_book_invalid_toml() {
        assert!(RuleBook::from_toml_str("brands = 3").is_err());
    }
}
