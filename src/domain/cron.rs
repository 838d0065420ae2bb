//! crontab 文本模型
//!
//! 按行解析并保留原文，只改动被操作的行。
//! 由本 agent 管理的任务以标记注释 `# n8n-host-agent: <name>` 开头，紧跟任务行。
//! 标记后的任务行只有在命令以 agent 程序开头时才算受管，用户自己的任务不会被覆盖。

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// 受管任务标记前缀
pub const MARKER_PREFIX: &str = "# n8n-host-agent:";

const MACROS: [&str; 8] = [
    "@reboot",
    "@yearly",
    "@annually",
    "@monthly",
    "@weekly",
    "@daily",
    "@midnight",
    "@hourly",
];

/// cron 解析错误
#[derive(Debug, Error, PartialEq)]
pub enum CronParseError {
    #[error("unknown schedule macro: {0}")]
    UnknownMacro(String),
    #[error("expected 5 schedule fields, got {0}")]
    FieldCount(usize),
    #[error("invalid schedule field: {0}")]
    InvalidField(String),
    #[error("job has no command")]
    MissingCommand,
}

/// 调度表达式（5 字段或 @ 宏）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct CronSchedule(String);

impl CronSchedule {
    pub fn parse(value: &str) -> Result<Self, CronParseError> {
        let value = value.trim();
        if value.starts_with('@') {
            let lower = value.to_ascii_lowercase();
            if MACROS.contains(&lower.as_str()) {
                return Ok(Self(lower));
            }
            return Err(CronParseError::UnknownMacro(value.to_string()));
        }

        let fields: Vec<&str> = value.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::FieldCount(fields.len()));
        }
        for field in &fields {
            if !is_valid_field(field) {
                return Err(CronParseError::InvalidField(field.to_string()));
            }
        }
        Ok(Self(fields.join(" ")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 每个字段由 `,` `-` `/` 分隔的原子组成，原子是 `*`、数字或三字母的月份/星期名
fn is_valid_field(field: &str) -> bool {
    !field.is_empty()
        && field.split([',', '-', '/']).all(|atom| {
            atom == "*"
                || (!atom.is_empty() && atom.chars().all(|c| c.is_ascii_digit()))
                || (atom.len() == 3 && atom.chars().all(|c| c.is_ascii_alphabetic()))
        })
}

/// 一条 cron 任务
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CronJob {
    pub schedule: CronSchedule,
    pub command: String,
}

impl CronJob {
    /// 解析任务行
    pub fn parse(line: &str) -> Result<Self, CronParseError> {
        let trimmed = line.trim();
        let (schedule, command) = if trimmed.starts_with('@') {
            let mut parts = trimmed.splitn(2, char::is_whitespace);
            let schedule = parts.next().unwrap_or_default();
            (schedule.to_string(), parts.next().unwrap_or_default())
        } else {
            let mut rest = trimmed;
            let mut fields = Vec::with_capacity(5);
            for _ in 0..5 {
                rest = rest.trim_start();
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                if end == 0 {
                    break;
                }
                fields.push(&rest[..end]);
                rest = &rest[end..];
            }
            if fields.len() < 5 {
                return Err(CronParseError::FieldCount(fields.len()));
            }
            (fields.join(" "), rest)
        };

        let command = command.trim();
        if command.is_empty() {
            return Err(CronParseError::MissingCommand);
        }

        Ok(Self {
            schedule: CronSchedule::parse(&schedule)?,
            command: command.to_string(),
        })
    }

    pub fn render(&self) -> String {
        format!("{} {}", self.schedule, self.command)
    }

    fn same_as(&self, other: &CronJob) -> bool {
        self.schedule == other.schedule && self.command == other.command
    }

    /// 命令的第一个词
    fn program(&self) -> &str {
        program_of(&self.command)
    }
}

fn program_of(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or_default()
}

/// crontab 中的一行
#[derive(Clone, Debug, PartialEq)]
pub enum CronLine {
    Job { job: CronJob, raw: String },
    Env(String),
    Comment(String),
    Blank,
    /// 无法解析的行原样保留
    Unparsed(String),
}

impl CronLine {
    fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return CronLine::Blank;
        }
        if trimmed.starts_with('#') {
            return CronLine::Comment(line.to_string());
        }
        if is_env_assignment(trimmed) {
            return CronLine::Env(line.to_string());
        }
        match CronJob::parse(trimmed) {
            Ok(job) => CronLine::Job {
                job,
                raw: line.to_string(),
            },
            Err(_) => CronLine::Unparsed(line.to_string()),
        }
    }

    fn render(&self) -> &str {
        match self {
            CronLine::Job { raw, .. } => raw,
            CronLine::Env(raw) | CronLine::Comment(raw) | CronLine::Unparsed(raw) => raw,
            CronLine::Blank => "",
        }
    }

    fn job(&self) -> Option<&CronJob> {
        match self {
            CronLine::Job { job, .. } => Some(job),
            _ => None,
        }
    }

    fn marker_name(&self) -> Option<&str> {
        match self {
            CronLine::Comment(raw) => raw
                .trim()
                .strip_prefix(MARKER_PREFIX)
                .map(str::trim)
                .filter(|name| !name.is_empty()),
            _ => None,
        }
    }
}

fn is_env_assignment(line: &str) -> bool {
    let Some(eq) = line.find('=') else {
        return false;
    };
    let name = line[..eq].trim_end();
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// 由本 agent 管理的任务
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ManagedJob {
    pub name: String,
    pub job: CronJob,
}

impl ManagedJob {
    pub fn new(
        name: impl Into<String>,
        schedule: &str,
        command: impl Into<String>,
    ) -> Result<Self, CronParseError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(CronParseError::MissingCommand);
        }
        Ok(Self {
            name: name.into(),
            job: CronJob {
                schedule: CronSchedule::parse(schedule)?,
                command: command.trim().to_string(),
            },
        })
    }

    fn marker(&self) -> String {
        format!("{} {}", MARKER_PREFIX, self.name)
    }

    fn owns(&self, job: &CronJob) -> bool {
        job.program() == self.job.program()
    }
}

/// 整个 crontab
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CronTable {
    lines: Vec<CronLine>,
    /// 受管任务的程序；未设置时标记后的任务行都算受管
    owner: Option<String>,
}

impl CronTable {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.lines().map(CronLine::parse).collect(),
            owner: None,
        }
    }

    /// 只把命令以 `program` 开头的任务行视为受管
    pub fn owned_by(mut self, program: &str) -> Self {
        self.owner = Some(program_of(program).to_string());
        self
    }

    /// 渲染为 crontab 文本，非空时以换行结尾
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line.render());
            out.push('\n');
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// 所有任务（含受管任务）
    pub fn jobs(&self) -> impl Iterator<Item = &CronJob> {
        self.lines.iter().filter_map(CronLine::job)
    }

    /// 所有受管任务
    pub fn managed_jobs(&self) -> Vec<ManagedJob> {
        (1..self.lines.len())
            .filter(|idx| self.is_managed_job_at(*idx))
            .filter_map(|idx| {
                let name = self.lines[idx - 1].marker_name()?;
                let job = self.lines[idx].job()?;
                Some(ManagedJob {
                    name: name.to_string(),
                    job: job.clone(),
                })
            })
            .collect()
    }

    fn find_marker(&self, name: &str) -> Option<usize> {
        self.lines
            .iter()
            .position(|line| line.marker_name() == Some(name))
    }

    fn is_managed_job_at(&self, idx: usize) -> bool {
        if idx == 0 || self.lines[idx - 1].marker_name().is_none() {
            return false;
        }
        match (self.lines[idx].job(), self.owner.as_deref()) {
            (Some(job), Some(owner)) => job.program() == owner,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// 插入或替换受管任务，返回是否有改动
    ///
    /// 标记后面不是本 agent 的任务时，新任务插在标记和它之间；
    /// 没有标记但已有完全相同的任务行时，给它补上标记
    pub fn upsert(&mut self, managed: &ManagedJob) -> bool {
        let new_line = CronLine::Job {
            raw: managed.job.render(),
            job: managed.job.clone(),
        };

        if let Some(idx) = self.find_marker(&managed.name) {
            let (same, owned) = match self.lines.get(idx + 1).and_then(CronLine::job) {
                Some(existing) => (existing.same_as(&managed.job), managed.owns(existing)),
                None => (false, false),
            };
            if same {
                return false;
            }
            if owned {
                self.lines[idx + 1] = new_line;
            } else {
                self.lines.insert(idx + 1, new_line);
            }
            return true;
        }

        let adoptable = (0..self.lines.len()).find(|idx| {
            !self.is_managed_job_at(*idx)
                && self.lines[*idx]
                    .job()
                    .is_some_and(|job| job.same_as(&managed.job))
        });
        match adoptable {
            Some(idx) => self.lines.insert(idx, CronLine::Comment(managed.marker())),
            None => {
                self.lines.push(CronLine::Comment(managed.marker()));
                self.lines.push(new_line);
            }
        }
        true
    }

    /// 删除受管任务（标记与任务行），返回是否找到
    pub fn remove(&mut self, name: &str) -> bool {
        let Some(idx) = self.find_marker(name) else {
            return false;
        };
        let end = if idx + 1 < self.lines.len() && self.is_managed_job_at(idx + 1) {
            idx + 2
        } else {
            idx + 1
        };
        self.lines.drain(idx..end);
        true
    }

    /// 删除完全重复的任务行，返回删除数量
    ///
    /// 受管任务优先保留，其余保留第一条
    pub fn dedupe(&mut self) -> usize {
        let key = |job: &CronJob| (job.schedule.as_str().to_string(), job.command.clone());
        let mut seen: HashSet<(String, String)> = (0..self.lines.len())
            .filter(|idx| self.is_managed_job_at(*idx))
            .filter_map(|idx| self.lines[idx].job().map(key))
            .collect();
        let mut kept_managed = HashSet::new();
        let mut drop = HashSet::new();

        for (idx, line) in self.lines.iter().enumerate() {
            let Some(job) = line.job() else { continue };
            let duplicate = if self.is_managed_job_at(idx) {
                !kept_managed.insert(key(job))
            } else {
                !seen.insert(key(job))
            };
            if duplicate {
                drop.insert(idx);
                if self.is_managed_job_at(idx) {
                    drop.insert(idx - 1);
                }
            }
        }

        let removed = drop.iter().filter(|idx| self.lines[**idx].job().is_some()).count();
        self.retain_indices(&drop);
        removed
    }

    /// 删除命令中包含 `needle` 的非受管任务，返回删除数量
    pub fn remove_matching(&mut self, needle: &str) -> usize {
        let drop: HashSet<usize> = self
            .lines
            .iter()
            .enumerate()
            .filter(|(idx, line)| {
                line.job().is_some_and(|job| job.command.contains(needle))
                    && !self.is_managed_job_at(*idx)
            })
            .map(|(idx, _)| idx)
            .collect();

        let removed = drop.len();
        self.retain_indices(&drop);
        removed
    }

    fn retain_indices(&mut self, drop: &HashSet<usize>) {
        if drop.is_empty() {
            return;
        }
        let mut idx = 0;
        self.lines.retain(|_| {
            let keep = !drop.contains(&idx);
            idx += 1;
            keep
        });
    }
}
