//! Pre-routing: does this request need the full pipeline, or can the
//! planner answer directly?
//!
//! A pure, deterministic classifier over signal tables. Rules, in order:
//! very short input → direct; multi-step markers → pipeline; action/tool
//! signals → pipeline; question signals → direct; short question-mark input
//! → direct; otherwise pipeline (the conservative default).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteDecision {
    /// The planner answers alone; no sub-tasks are created.
    DirectAnswer,
    /// Full planner → executor → reviewer pipeline.
    Pipeline,
}

// ---------------------------------------------------------------------------
// Signal tables - data, not code
// ---------------------------------------------------------------------------

/// Markers of multi-step requests that always need decomposition.
const MULTI_STEP_SIGNALS: &[&str] = &[
    " and then ",
    "first ",
    "step 1",
    "步骤",
    "然后再",
    "接着",
    "首先",
    "第一步",
    "分别",
    "一方面",
    "另一方面",
    "同时",
];

/// Action signals: the request needs tools, files, or execution.
const ACTION_SIGNALS: &[&str] = &[
    // English
    "write", "create", "generate", "build", "code", "file", "run", "execute", "search",
    "download", "analyze", "analyse", "compute", "calculate", "deploy", "install",
    "configure", "screenshot", "browser", "edit", "delete", "upload", "compare", "report",
    "script", "database", "website", "translate",
    // Chinese
    "写", "创建", "生成", "构建", "编写", "运行", "执行", "搜索", "下载", "分析", "计算",
    "部署", "截图", "安装", "配置", "修改", "编辑", "删除", "上传", "翻译", "对比", "报告",
    "代码", "文件", "脚本", "网站", "数据库",
];

/// Question signals: simple knowledge Q&A the planner answers directly.
const QUESTION_SIGNALS: &[&str] = &[
    // English
    "what is", "explain", "define", "describe", "tell me about", "how does", "what does",
    "meaning of",
    // Chinese
    "什么是", "解释", "定义", "描述", "介绍", "说说", "是什么", "怎么理解", "含义",
];

/// Length below which input is trivially direct.
const TRIVIAL_LEN: usize = 5;
/// Question-mark inputs shorter than this are direct.
const SHORT_QUESTION_LEN: usize = 50;

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Classify user input. Pure and deterministic.
pub fn classify(input: &str) -> RouteDecision {
    let lower = input.trim().to_lowercase();

    if lower.chars().count() < TRIVIAL_LEN {
        return RouteDecision::DirectAnswer;
    }

    if MULTI_STEP_SIGNALS.iter().any(|sig| lower.contains(sig)) {
        return RouteDecision::Pipeline;
    }

    if ACTION_SIGNALS.iter().any(|sig| lower.contains(sig)) {
        return RouteDecision::Pipeline;
    }

    if QUESTION_SIGNALS.iter().any(|sig| lower.contains(sig)) {
        return RouteDecision::DirectAnswer;
    }

    if (input.contains('?') || input.contains('？'))
        && input.chars().count() < SHORT_QUESTION_LEN
    {
        return RouteDecision::DirectAnswer;
    }

    RouteDecision::Pipeline
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
