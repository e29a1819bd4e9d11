//! Canned rows and model replies shared by the integration tests

/// One input row with the reply the stub model gives for it and the
/// diseases the pipeline should report.
#[derive(Debug, Clone)]
pub struct DiseaseCase {
    pub text: &'static str,
    pub reply: &'static str,
    pub expected: &'static [&'static str],
    pub description: &'static str,
}

pub const SCENARIO: &[DiseaseCase] = &[
    DiseaseCase {
        text: "感冒",
        reply: "[感冒]",
        expected: &["感冒"],
        description: "single bracketed disease",
    },
    DiseaseCase {
        text: "体检未见异常",
        reply: "未识别到病种",
        expected: &[],
        description: "none-found sentinel",
    },
    DiseaseCase {
        text: "糖尿病、高血压",
        reply: "糖尿病、高血压",
        expected: &["糖尿病", "高血压"],
        description: "free-text reply with enumeration comma",
    },
];

pub const EXTRA_CASES: &[DiseaseCase] = &[
    DiseaseCase {
        text: "患者既往有冠心病史，近期诊断为2型糖尿病",
        reply: "[冠心病, 2型糖尿病]",
        expected: &["冠心病", "2型糖尿病"],
        description: "bracketed list keeps order",
    },
    DiseaseCase {
        text: "反复咳嗽三周",
        reply: "1. 慢性支气管炎；无",
        expected: &["慢性支气管炎"],
        description: "enumeration prefix and none marker dropped",
    },
    DiseaseCase {
        text: "术后复查",
        reply: "文本中未识别到明确病种",
        expected: &[],
        description: "not-found marker inside a sentence",
    },
];

/// `n` distinct rows; the stub echoes each back as a one-item list.
pub fn numbered_rows(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("病例{}", i)).collect()
}
