use crate::services::llm::ChatMessage;

/// Default system prompt for disease extraction.
pub const DEFAULT_SYSTEM_PROMPT: &str = "你是一个专业的医疗文本分析助手，专门从文本中识别和提取病种名称。

规则：
1. 仔细分析文本，识别其中提到的所有疾病、病症、病种名称
2. 只提取明确的病种名称，不要包含症状描述或治疗方式
3. 病种可以是通用疾病名称（如\"高血压\"、\"糖尿病\"）或特定病种（如\"阿尔茨海默病\"）
4. 如果文本中没有病种信息，返回\"未识别到病种\"
5. 使用标准医学术语

输出格式要求：
- 直接输出识别到的病种列表
- 格式：[病种1, 病种2, ...]
- 如果没有病种：未识别到病种
- 不要输出任何解释或其他文字
- 不要使用 markdown 格式";

/// Build the conversation for one row.
///
/// A supplied system prompt replaces the default; a non-blank user prompt is
/// appended to the row text as an extra requirement.
pub fn build_messages(
    text: &str,
    system_prompt: Option<&str>,
    user_prompt: Option<&str>,
) -> Vec<ChatMessage> {
    let system = system_prompt
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);

    let mut content = format!("请分析以下文本，提取其中的病种名称：\n\n文本：{}", text);
    if let Some(extra) = user_prompt.map(str::trim).filter(|s| !s.is_empty()) {
        content.push_str("\n\n额外要求：");
        content.push_str(extra);
    }

    vec![ChatMessage::system(system), ChatMessage::user(content)]
}
