/// Configurações do servidor
/// Carregadas de variáveis de ambiente, opcionalmente complementadas por um arquivo app.env
/// Valores padrão são fornecidos para desenvolvimento
use anyhow::{Context, bail};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tokio::sync::Semaphore;
use tracing::info;

/// Nome do arquivo de variáveis procurado na inicialização
pub const ENV_FILE: &str = "app.env";

/// Limites do SETTINGS_MAX_FRAME_SIZE do HTTP/2 (RFC 9113, 6.5.2)
const MIN_FRAME_SIZE: u32 = 16_384;
const MAX_FRAME_SIZE: u32 = 16_777_215;

/// Estrutura principal de configurações da aplicação
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cfg {
    /// Porta HTTP onde o servidor irá escutar
    pub port: u16,

    /// Tempo que o circuit breaker fica aberto, e janela de contagem de falhas
    pub cb_interval: Duration,

    /// Número de falhas que abre o circuit breaker
    pub cb_threshold: u32,

    /// Máximo de streams HTTP/2 simultâneos por conexão
    pub max_concurrent_streams: u32,

    /// Tamanho máximo de frame HTTP/2 aceito na leitura (bytes)
    pub max_read_frame_size: u32,

    /// Tempo máximo de conexão ociosa
    pub idle_timeout: Duration,

    /// Timeout total para processar uma requisição (milissegundos)
    pub request_timeout_ms: u64,

    /// Limite máximo de conexões concorrentes
    pub concurrency_limit: usize,

    /// Prazo para drenar conexões no desligamento
    pub shutdown_timeout: Duration,
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            port: 8080,
            cb_interval: Duration::from_secs(10),
            cb_threshold: 5,
            max_concurrent_streams: 250,
            max_read_frame_size: 1 << 20,
            idle_timeout: Duration::from_secs(10),
            request_timeout_ms: 5_000,
            concurrency_limit: 1024,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Cfg {
    /// Carrega configurações do ambiente e do app.env, se existir
    /// Variáveis do processo têm precedência sobre o arquivo
    pub fn load() -> anyhow::Result<Self> {
        let file_vars = match find_env_file(&std::env::current_dir()?) {
            Some(path) => {
                info!("loading env file {}", path.display());
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                parse_env_file(&raw)
            }
            None => {
                info!("no env file provided, using only env variables");
                HashMap::new()
            }
        };

        Self::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| file_vars.get(key).cloned())
        })
    }

    /// Monta a configuração a partir de uma função de busca por chave
    /// Chaves ausentes usam o padrão; valores malformados são erro
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            // ========== SERVIDOR ==========
            port: parse_or(var("PORT"), "PORT", d.port)?,

            // ========== CIRCUIT BREAKER ==========
            cb_interval: duration_or(
                var("CIRCUIT_BREAKER_INTERVAL"),
                "CIRCUIT_BREAKER_INTERVAL",
                d.cb_interval,
            )?,
            cb_threshold: parse_or(
                var("CIRCUIT_BREAKER_THRESHOLD"),
                "CIRCUIT_BREAKER_THRESHOLD",
                d.cb_threshold,
            )?,

            // ========== HTTP/2 ==========
            // 0 significa "usar o padrão", como no http2.Server
            max_concurrent_streams: match parse_or(
                var("MAX_CONCURRENT_STREAMS"),
                "MAX_CONCURRENT_STREAMS",
                d.max_concurrent_streams,
            )? {
                0 => d.max_concurrent_streams,
                n => n,
            },
            // fora da faixa válida volta ao padrão de 1 MiB
            max_read_frame_size: Some(parse_or(
                var("MAX_READ_FRAME_SIZE"),
                "MAX_READ_FRAME_SIZE",
                d.max_read_frame_size,
            )?)
            .filter(|n| (MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(n))
            .unwrap_or(d.max_read_frame_size),
            idle_timeout: duration_or(var("IDLE_TIMEOUT"), "IDLE_TIMEOUT", d.idle_timeout)?,

            // ========== TIMEOUTS E LIMITES ==========
            request_timeout_ms: parse_or(
                var("REQUEST_TIMEOUT_MS"),
                "REQUEST_TIMEOUT_MS",
                d.request_timeout_ms,
            )?,
            concurrency_limit: match parse_or(
                var("CONCURRENCY_LIMIT"),
                "CONCURRENCY_LIMIT",
                d.concurrency_limit,
            )? {
                n if n > Semaphore::MAX_PERMITS => {
                    bail!("CONCURRENCY_LIMIT must be at most {}", Semaphore::MAX_PERMITS)
                }
                n => n.max(1),
            },
            shutdown_timeout: duration_or(
                var("SHUTDOWN_TIMEOUT"),
                "SHUTDOWN_TIMEOUT",
                d.shutdown_timeout,
            )?,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {v:?}")),
        None => Ok(default),
    }
}

fn duration_or(raw: Option<String>, key: &str, default: Duration) -> anyhow::Result<Duration> {
    match raw {
        Some(v) => parse_duration(&v).with_context(|| format!("invalid duration for {key}: {v:?}")),
        None => Ok(default),
    }
}

/// Aceita "500ms", "10s", "2m" ou um inteiro (segundos)
pub fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let s = raw.trim();
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    if num.is_empty() {
        bail!("missing numeric value");
    }
    let n: u64 = num.parse()?;
    Ok(match unit.trim() {
        "ms" => Duration::from_millis(n),
        "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n.saturating_mul(60)),
        "h" => Duration::from_secs(n.saturating_mul(3600)),
        other => bail!("unknown duration unit {other:?}"),
    })
}

/// Procura o app.env no diretório atual e, em seguida, dois níveis acima
pub fn find_env_file(cwd: &Path) -> Option<PathBuf> {
    [cwd.join(ENV_FILE), cwd.join("../../").join(ENV_FILE)]
        .into_iter()
        .find(|p| p.is_file())
}

/// Formato KEY=VALUE, com comentários (#), linhas vazias,
/// prefixo `export` opcional e aspas opcionais
pub fn parse_env_file(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let l = l.strip_prefix("export ").unwrap_or(l);
            let (k, v) = l.split_once('=')?;
            let v = v.trim();
            let v = ['"', '\'']
                .iter()
                .find_map(|q| v.strip_prefix(*q).and_then(|x| x.strip_suffix(*q)))
                .unwrap_or(v);
            Some((k.trim().to_string(), v.to_string()))
        })
        .filter(|(k, _)| !k.is_empty())
        .collect()
}
