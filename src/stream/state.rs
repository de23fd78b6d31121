use super::guard::WhitespaceGuard;
use crate::protocol::anthropic::{AnthropicStreamEvent, BlockDelta, ContentBlockStart, StopReason};
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};

/// 内容位置：(output_index, content_index)
pub type BlockKey = (u32, u32);

/// 一个进行中的工具调用与其 Anthropic 块的关联
#[derive(Debug, Clone)]
pub struct ToolCallState {
    pub block_index: u32,
    pub id: String,
    pub name: String,
    pub whitespace: WhitespaceGuard,
}

/// Chat 流中已收到 finish_reason、还在等 usage 的结束信息
#[derive(Debug, Clone, Copy)]
pub struct PendingStop {
    pub stop_reason: Option<StopReason>,
}

/// 单个流式响应的转换状态
///
/// 只由读取上游事件的那一个循环持有和修改，不需要锁。
/// 块索引单调递增，关闭后不再复用。
#[derive(Debug, Default)]
pub struct StreamState {
    pub message_start_sent: bool,
    /// 终止标记：置位后不再输出任何事件
    pub message_completed: bool,
    next_block_index: u32,
    open_blocks: BTreeSet<u32>,
    block_has_delta: HashSet<u32>,
    blocks_by_key: HashMap<BlockKey, u32>,
    /// key: Responses 的 output_index / Chat 的 tool_call index
    pub tool_calls: HashMap<u32, ToolCallState>,
    pub pending_stop: Option<PendingStop>,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, index: u32) -> bool {
        self.open_blocks.contains(&index)
    }

    pub fn has_delta(&self, index: u32) -> bool {
        self.block_has_delta.contains(&index)
    }

    /// 该位置上的块（无论是否已关闭）是否收到过增量
    pub fn key_has_delta(&self, key: BlockKey) -> bool {
        self.blocks_by_key
            .get(&key)
            .map(|index| self.has_delta(*index))
            .unwrap_or(false)
    }

    /// 分配一个新块，开始前先关闭其它所有打开的块
    pub fn start_block(
        &mut self,
        content_block: ContentBlockStart,
        events: &mut Vec<AnthropicStreamEvent>,
    ) -> u32 {
        self.close_all(events);

        let index = self.next_block_index;
        self.next_block_index += 1;
        events.push(AnthropicStreamEvent::ContentBlockStart {
            index,
            content_block,
        });
        self.open_blocks.insert(index);
        index
    }

    /// 取某个位置上打开的块；没有或已关闭时开一个新块
    pub fn ensure_keyed_block(
        &mut self,
        key: BlockKey,
        content_block: impl FnOnce() -> ContentBlockStart,
        events: &mut Vec<AnthropicStreamEvent>,
    ) -> u32 {
        if let Some(&index) = self.blocks_by_key.get(&key) {
            if self.is_open(index) {
                return index;
            }
        }
        let index = self.start_block(content_block(), events);
        self.blocks_by_key.insert(key, index);
        index
    }

    /// 取工具调用对应的打开块；关联不存在时用兜底 id/name 建立，块已关闭时重新打开一个新块
    pub fn ensure_tool_block(
        &mut self,
        key: u32,
        id: Option<&str>,
        name: Option<&str>,
        events: &mut Vec<AnthropicStreamEvent>,
    ) -> u32 {
        if let Some(call) = self.tool_calls.get(&key) {
            if self.is_open(call.block_index) {
                return call.block_index;
            }
        }

        let (id, name, whitespace) = match self.tool_calls.get(&key) {
            Some(call) => (call.id.clone(), call.name.clone(), call.whitespace),
            None => (
                id.map(str::to_string)
                    .unwrap_or_else(|| format!("tool_call_{}", self.next_block_index)),
                name.unwrap_or("function").to_string(),
                WhitespaceGuard::default(),
            ),
        };

        let block_index = self.start_block(
            ContentBlockStart::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: json!({}),
            },
            events,
        );
        self.tool_calls.insert(
            key,
            ToolCallState {
                block_index,
                id,
                name,
                whitespace,
            },
        );
        block_index
    }

    pub fn push_delta(&mut self, index: u32, delta: BlockDelta, events: &mut Vec<AnthropicStreamEvent>) {
        events.push(AnthropicStreamEvent::ContentBlockDelta { index, delta });
        self.block_has_delta.insert(index);
    }

    pub fn close_block(&mut self, index: u32, events: &mut Vec<AnthropicStreamEvent>) {
        if self.open_blocks.remove(&index) {
            events.push(AnthropicStreamEvent::ContentBlockStop { index });
        }
    }

    pub fn close_all(&mut self, events: &mut Vec<AnthropicStreamEvent>) {
        let open: Vec<u32> = self.open_blocks.iter().copied().collect();
        for index in open {
            self.close_block(index, events);
        }
    }

    /// 终止本次交换：关闭所有块，输出 error 事件
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<AnthropicStreamEvent> {
        let mut events = Vec::new();
        self.close_all(&mut events);
        self.tool_calls.clear();
        self.pending_stop = None;
        self.message_completed = true;
        events.push(AnthropicStreamEvent::error(message));
        events
    }
}

/// 校验事件序列的块索引约束：
/// 每个 delta/stop 之前恰好有一个未匹配的 start，索引关闭后不再出现
#[cfg(test)]
pub(crate) fn assert_well_formed(events: &[AnthropicStreamEvent]) {
    let mut open = HashSet::new();
    let mut seen = HashSet::new();
    for event in events {
        match event {
            AnthropicStreamEvent::ContentBlockStart { index, .. } => {
                assert!(seen.insert(*index), "block index {} reused", index);
                open.insert(*index);
            }
            AnthropicStreamEvent::ContentBlockDelta { index, .. } => {
                assert!(open.contains(index), "delta for block {} that is not open", index);
            }
            AnthropicStreamEvent::ContentBlockStop { index } => {
                assert!(open.remove(index), "stop for block {} that is not open", index);
            }
            AnthropicStreamEvent::MessageDelta { .. }
            | AnthropicStreamEvent::MessageStop
            | AnthropicStreamEvent::Error { .. } => {
                assert!(open.is_empty(), "terminal event with open blocks {:?}", open);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text() -> ContentBlockStart {
        ContentBlockStart::Text { text: String::new() }
    }

    #[test]
    fn reopening_a_closed_key_allocates_a_fresh_index() {
        let mut state = StreamState::new();
        let mut events = Vec::new();

        let first = state.ensure_keyed_block((0, 0), text, &mut events);
        assert_eq!(state.ensure_keyed_block((0, 0), text, &mut events), first);

        let other = state.ensure_keyed_block((1, 0), text, &mut events);
        assert!(!state.is_open(first));

        let again = state.ensure_keyed_block((0, 0), text, &mut events);
        assert!(again > other);
        state.close_all(&mut events);
        assert_well_formed(&events);
    }

    #[test]
    fn tool_block_falls_back_to_synthetic_identity() {
        let mut state = StreamState::new();
        let mut events = Vec::new();
        let index = state.ensure_tool_block(3, None, None, &mut events);

        match &events[0] {
            AnthropicStreamEvent::ContentBlockStart {
                content_block: ContentBlockStart::ToolUse { id, name, .. },
                ..
            } => {
                assert_eq!(id, &format!("tool_call_{}", index));
                assert_eq!(name, "function");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn fail_closes_blocks_before_error() {
        let mut state = StreamState::new();
        let mut events = Vec::new();
        let index = state.ensure_keyed_block((0, 0), text, &mut events);
        state.push_delta(index, BlockDelta::TextDelta { text: "a".into() }, &mut events);
        events.extend(state.fail("boom"));

        assert!(state.message_completed);
        assert!(matches!(events[events.len() - 2], AnthropicStreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(events.last(), Some(AnthropicStreamEvent::Error { .. })));
        assert_well_formed(&events);
    }
}
