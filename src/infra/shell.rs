//! 远程 shell 命令的结构化拼装
//!
//! 所有插值（域名、路径）必须经过引号包裹后才能进入命令字符串

/// 单引号包裹一个值，内部单引号按 POSIX 规则转义
pub fn sh_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'/' | b'.' | b'-' | b'_' | b':'))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// 在指定目录下执行 docker compose 子命令
pub fn compose_command(project_dir: &str, manifest: &str, args: &[&str]) -> String {
    format!(
        "cd {} && docker compose -f {} {}",
        sh_quote(project_dir),
        sh_quote(manifest),
        args.join(" ")
    )
}

/// 幂等创建远端目录
pub fn mkdir_command(path: &str) -> String {
    format!("mkdir -p {}", sh_quote(path))
}

/// 将 stdin 写入远端文件
pub fn write_file_command(path: &str) -> String {
    format!("cat > {}", sh_quote(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_values_pass_through() {
        assert_eq!(sh_quote("/opt/deploymat-app"), "/opt/deploymat-app");
        assert_eq!(sh_quote("example.com"), "example.com");
        assert_eq!(sh_quote("redis:7"), "redis:7");
    }

    #[test]
    fn test_special_characters_are_quoted() {
        assert_eq!(sh_quote("a b"), "'a b'");
        assert_eq!(sh_quote("$(reboot)"), "'$(reboot)'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn test_compose_command() {
        let cmd = compose_command("/opt/app", "docker-compose.prod.yml", &["up", "-d", "--build"]);
        assert_eq!(
            cmd,
            "cd /opt/app && docker compose -f docker-compose.prod.yml up -d --build"
        );
    }

    #[test]
    fn test_injection_is_neutralized() {
        let cmd = mkdir_command("/opt/x; rm -rf /");
        assert_eq!(cmd, "mkdir -p '/opt/x; rm -rf /'");
    }
}
