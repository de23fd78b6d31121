use crate::error::Error;

/// 函数参数中允许的最长连续空白
pub const MAX_CONSECUTIVE_WHITESPACE: usize = 20;

/// 连续空白检测
///
/// 部分上游在生成工具参数时会陷入无限换行，直到耗尽输出上限。
/// 计数跨越分片边界，遇到非空白字符清零。
#[derive(Debug, Default, Clone, Copy)]
pub struct WhitespaceGuard {
    run: usize,
}

impl WhitespaceGuard {
    pub fn feed(&mut self, fragment: &str) -> Result<(), Error> {
        for ch in fragment.chars() {
            if matches!(ch, ' ' | '\t' | '\r' | '\n') {
                self.run += 1;
                if self.run > MAX_CONSECUTIVE_WHITESPACE {
                    return Err(Error::StreamValidation(format!(
                        "Received function call arguments delta containing more than {} consecutive whitespace characters.",
                        MAX_CONSECUTIVE_WHITESPACE
                    )));
                }
            } else {
                self.run = 0;
            }
        }
        Ok(())
    }

    pub fn run(&self) -> usize {
        self.run
    }
}
