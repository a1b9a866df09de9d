//! 命令行参数

use crate::config::AppConfig;
use crate::core::mirror_url::MirrorOptions;
use crate::core::status::OutputConfig;
use anyhow::{bail, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// 在 S3 兼容存储和本地目录之间同步对象
#[derive(Parser, Debug, Clone)]
#[command(name = "s3mirror", version, about)]
pub struct Cli {
    /// 源地址：`alias/bucket/prefix` 或本地路径
    pub source: String,

    /// 目标地址：`alias/bucket/prefix` 或本地路径
    pub target: String,

    /// 覆盖内容不同的目标对象
    #[arg(long)]
    pub overwrite: bool,

    /// 删除源中不存在的目标对象
    #[arg(long)]
    pub remove: bool,

    /// 初始同步后持续监听源的变更
    #[arg(short = 'w', long)]
    pub watch: bool,

    /// 监听模式下跳过初始同步
    #[arg(long, requires = "watch")]
    pub skip_initial_sync: bool,

    /// 只显示将要执行的操作
    #[arg(long, alias = "dry-run")]
    pub fake: bool,

    /// 双活模式，用于两个方向同时镜像
    #[arg(long)]
    pub active_active: bool,

    /// 排除匹配的对象，可多次指定
    #[arg(long, value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// 只镜像早于该时长的对象，如 7d10h31s
    #[arg(long, value_name = "DURATION")]
    pub older_than: Option<String>,

    /// 只镜像晚于该时长的对象
    #[arg(long, value_name = "DURATION")]
    pub newer_than: Option<String>,

    /// 目标对象的存储类型
    #[arg(long, visible_alias = "sc", value_name = "CLASS")]
    pub storage_class: Option<String>,

    /// 附加的用户元数据，格式 `k1=v1;k2=v2`
    #[arg(long, value_name = "ATTRS")]
    pub attr: Option<String>,

    /// 上传时附带校验和，由 S3 校验内容
    #[arg(long)]
    pub md5: bool,

    /// 禁用分片上传
    #[arg(long)]
    pub disable_multipart: bool,

    /// 创建存储桶时使用的区域
    #[arg(long, default_value = "us-east-1")]
    pub region: String,

    /// 工作者数量上限
    #[arg(long, value_name = "N")]
    pub max_workers: Option<usize>,

    /// 比较用户元数据
    #[arg(long)]
    pub metadata: bool,

    /// 比较修改时间，源更新时覆盖目标
    #[arg(long)]
    pub mtime: bool,

    /// 以 JSON 输出
    #[arg(long)]
    pub json: bool,

    /// 不显示进度条
    #[arg(short, long)]
    pub quiet: bool,

    /// 输出调试日志
    #[arg(long)]
    pub debug: bool,

    /// 配置目录
    #[arg(long, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

impl Cli {
    pub fn output(&self) -> OutputConfig {
        OutputConfig {
            json: self.json,
            quiet: self.quiet,
        }
    }

    /// 合并配置文件和命令行参数
    pub fn mirror_options(&self, config: &AppConfig) -> Result<MirrorOptions> {
        let mut parallel = config.parallel.clone();
        if let Some(max) = self.max_workers {
            if max == 0 {
                bail!("--max-workers 必须大于 0");
            }
            parallel.max_workers = max;
            parallel.initial_workers = parallel.initial_workers.min(max);
        }

        Ok(MirrorOptions {
            is_fake: self.fake,
            is_overwrite: self.overwrite,
            is_remove: self.remove,
            is_watch: self.watch,
            skip_initial_sync: self.skip_initial_sync,
            active_active: self.active_active,
            is_metadata: self.metadata,
            is_mtime: self.mtime,
            exclude: self.exclude.clone(),
            older_than: self.older_than.clone(),
            newer_than: self.newer_than.clone(),
            storage_class: self.storage_class.clone(),
            user_metadata: match &self.attr {
                Some(attr) => parse_attr(attr)?,
                None => BTreeMap::new(),
            },
            md5: self.md5,
            disable_multipart: self.disable_multipart,
            region: self.region.clone(),
            parallel,
        })
    }
}

/// 解析 `k1=v1;k2=v2` 形式的元数据
pub fn parse_attr(input: &str) -> Result<BTreeMap<String, String>> {
    let mut attrs = BTreeMap::new();
    for pair in input.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("无效的元数据 `{}`，格式应为 key=value", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("元数据键不能为空: `{}`", pair);
        }
        attrs.insert(key.to_string(), value.trim().to_string());
    }
    Ok(attrs)
}
