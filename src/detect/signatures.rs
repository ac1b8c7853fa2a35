//! Static signature sets for processes, logs, files, and file content.
//!
//! All matching is case-insensitive substring matching unless noted.

use std::sync::OnceLock;

use regex::Regex;

/// Command-line fragments of known miners, tunnels, proxies, and scanners.
pub const PROCESS_DENYLIST: &[&str] = &[
    "xmrig",
    "xmr-stak",
    "minerd",
    "cpuminer",
    "nbminer",
    "t-rex",
    "lolminer",
    "gminer",
    "phoenixminer",
    "ethminer",
    "srbminer",
    "nanominer",
    "ngrok",
    "frpc",
    "frps",
    "cloudflared",
    "gost",
    "v2ray",
    "xray",
    "sing-box",
    "hysteria",
    "ss-server",
    "ss-local",
    "3proxy",
    "microsocks",
    "chisel",
    "proxychains",
    "masscan",
    "zmap",
    "hydra",
    "sshx",
    "tmate",
];

/// A group of log indicators that records its own detection type.
pub struct LogCategory {
    pub detection_type: &'static str,
    pub indicators: &'static [&'static str],
}

pub const LOG_CATEGORIES: &[LogCategory] = &[
    LogCategory {
        detection_type: "Remote Access Tool Indicators",
        indicators: &[
            "ngrok",
            "tunnel established",
            "started tunnel",
            "frp client",
            "cloudflared",
            "serveo.net",
            "tmate",
            "sshx.io",
            "reverse shell",
        ],
    },
    LogCategory {
        detection_type: "Mining Indicators",
        indicators: &[
            "stratum+tcp",
            "stratum+ssl",
            "accepted share",
            "new job from",
            "hashrate",
            "randomx",
            "cryptonight",
            "xmrig",
            "donate-level",
        ],
    },
    LogCategory {
        detection_type: "Proxy Indicators",
        indicators: &[
            "socks5",
            "proxy server listening",
            "v2ray",
            "xray core",
            "shadowsocks",
            "vmess",
            "vless",
            "trojan-go",
        ],
    },
    LogCategory {
        detection_type: "Bot Indicators",
        indicators: &[
            "discord.js",
            "logged in as",
            "whatsapp",
            "scan the qr code",
            "telegram bot",
            "selfbot",
        ],
    },
];

/// Flat list of suspicious words that each contribute to one shared type.
pub const SUSPICIOUS_LOG_WORDS: &[&str] = &[
    "2miners",
    "nanopool",
    "ethermine",
    "supportxmr",
    "hashvault",
    "minexmr",
    "nicehash",
    "unmineable",
    "moneroocean",
    "herominers",
    "f2pool",
    "stratum",
    "ddos",
    "booter",
    "botnet",
];

/// Phrases printed by a legitimate game-server boot.
pub const LEGIT_STARTUP_PHRASES: &[&str] = &[
    "Done (",
    "Preparing spawn area",
    "Preparing level",
    "Starting minecraft server",
    "Loading libraries, please wait",
    "Starting Minecraft server on",
];

/// Relative-path prefixes never descended into.
pub const SKIP_PREFIXES: &[&str] = &[
    ".git/",
    "logs/",
    "cache/",
    "libraries/",
    "versions/",
    "crash-reports/",
    "world/",
    "world_nether/",
    "world_the_end/",
    "bundler/",
    "plugins/.paper-remapped/",
    "node_modules/",
];

/// Exact filenames never inspected.
pub const SKIP_FILENAMES: &[&str] = &[
    "eula.txt",
    "usercache.json",
    "banned-ips.json",
    "banned-players.json",
    "ops.json",
    "whitelist.json",
    "version_history.json",
    "permissions.yml",
    "help.yml",
    "commands.yml",
];

/// Extensions never worth hashing: logs, archives, media, world data.
pub const SKIP_EXTENSIONS: &[&str] = &[
    "log", "gz", "zip", "tar", "7z", "rar", "mca", "mcr", "dat", "dat_old", "nbt", "png",
    "jpg", "jpeg", "gif", "ogg", "mp3", "mp4", "wav", "db", "sqlite", "lock",
];

/// Filename fragments of miners, tunnels, and proxies.
pub const SUSPICIOUS_NAMES: &[&str] = &[
    "xmrig",
    "minerd",
    "cpuminer",
    "nbminer",
    "lolminer",
    "t-rex",
    "phoenixminer",
    "ngrok",
    "frpc",
    "frps",
    "cloudflared",
    "gost",
    "v2ray",
    "xray",
    "hysteria",
    "3proxy",
    "chisel",
    "proxychains",
];

/// Executable and script formats that do not belong in a game volume.
pub const SUSPICIOUS_EXTENSIONS: &[&str] = &["exe", "bat", "cmd", "ps1", "vbs", "sh", "py", "elf", "bin"];

/// Words that mark file content as suspicious.
pub const SUSPICIOUS_CONTENT_WORDS: &[&str] = &[
    "stratum+tcp",
    "stratum+ssl",
    "xmrig",
    "cryptonight",
    "randomx",
    "donate-level",
    "nicehash",
    "2miners",
    "nanopool",
    "supportxmr",
    "moneroocean",
    "ngrok",
    "authtoken",
    "socks5",
    "vmess://",
    "vless://",
    "ss://",
];

/// Fixed paths whose presence marks package-manager activity.
pub const PACKAGE_SENTINELS: &[(&str, &str)] = &[
    (".npm", "npm cache directory"),
    (".cache/pip", "pip cache directory"),
    (".local/bin", "user-installed executables"),
    ("node_modules/.package-lock.json", "npm install lockfile"),
    ("node_modules/.bin", "npm executable shims"),
    ("bun.lockb", "bun lockfile"),
];

/// Startup scripts whose content is checked before the general walk.
pub const STARTUP_SCRIPTS: &[&str] = &["start.sh", "run.sh", "startup.sh"];

/// The main executable jar checked for a suspiciously small size.
pub const SERVER_JAR: &str = "server.jar";

/// Dependencies of messaging-automation bots.
pub const BOT_PACKAGES: &[&str] = &[
    "discord.js",
    "discord.js-selfbot-v13",
    "discord-user-bots",
    "eris",
    "oceanic.js",
    "telegraf",
    "node-telegram-bot-api",
    "grammy",
    "whatsapp-web.js",
    "@whiskeysockets/baileys",
    "@adiwajshing/baileys",
    "venom-bot",
    "mineflayer",
];

/// Matches `a.b.c.d:port`.
pub fn ipv4_port_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d):\d{1,5}\b")
            .expect("static ipv4:port pattern is valid")
    })
}

/// Every pattern from `patterns` found in `haystack`, ignoring case.
pub fn find_matches<'a>(haystack: &str, patterns: &[&'a str]) -> Vec<&'a str> {
    let lower = haystack.to_lowercase();
    patterns
        .iter()
        .filter(|p| lower.contains(&p.to_lowercase()))
        .copied()
        .collect()
}

pub fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    !find_matches(haystack, patterns).is_empty()
}

/// True when the log tail looks like ordinary server boot output.
pub fn is_startup_noise(logs: &str) -> bool {
    LEGIT_STARTUP_PHRASES.iter().any(|p| logs.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_matches_ignores_case() {
        let hits = find_matches("Connecting to ETH.2MINERS.COM:2020", SUSPICIOUS_LOG_WORDS);
        assert_eq!(hits, vec!["2miners"]);
    }

    #[test]
    fn test_ipv4_port_regex() {
        let re = ipv4_port_regex();
        assert!(re.is_match("pool at 192.168.10.4:3333"));
        assert!(re.is_match("1.2.3.4:80"));
        assert!(!re.is_match("version 1.20.4"));
        assert!(!re.is_match("999.1.1.1:80"));
    }

    #[test]
    fn test_startup_noise() {
        assert!(is_startup_noise("[12:00:01 INFO]: Done (4.512s)! For help, type \"help\""));
        assert!(!is_startup_noise("accepted share 12/12"));
    }

    #[test]
    fn test_process_denylist_matches_full_command() {
        assert!(contains_any("/tmp/.x/XMRig --donate-level 1 -o pool", PROCESS_DENYLIST));
        assert!(!contains_any("java -Xmx2G -jar server.jar nogui", PROCESS_DENYLIST));
    }
}
