use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::transport::{ConversationId, ServerFrame, SessionId};

pub type LinkId = u64;

/// Frames kept for a detached session. A session whose backlog overflows is
/// expired instead of losing frames.
pub const BACKLOG_LIMIT: usize = 4096;

/// Answered conversations remembered per session for recognising re-sent
/// frames. Conversations still in progress are always remembered.
pub const REPLY_CACHE_LIMIT: usize = 1024;

/// A session known to the broker. It outlives its connection: after a
/// disconnect it stays detached for the retention period and can be resumed.
#[derive(Debug)]
pub struct Client {
    pub id: SessionId,
    pub principal: String,
    /// Connection the session is attached to, if any.
    pub link: Option<LinkId>,
    pub detached_at: Option<Instant>,
    backlog: VecDeque<ServerFrame>,
    replies: ReplyCache,
}

impl Client {
    pub fn new(principal: &str, link: LinkId) -> Self {
        Self {
            id: SessionId::new(format!("session-{}", uuid::Uuid::new_v4())),
            principal: principal.to_string(),
            link: Some(link),
            detached_at: None,
            backlog: VecDeque::new(),
            replies: ReplyCache::default(),
        }
    }

    pub fn attach(&mut self, link: LinkId) {
        self.link = Some(link);
        self.detached_at = None;
    }

    pub fn detach(&mut self) {
        self.link = None;
        self.detached_at = Some(Instant::now());
    }

    /// Hold a frame until the session is resumed. Returns `false`, keeping
    /// nothing, once `limit` frames are held.
    pub fn defer(&mut self, frame: ServerFrame, limit: usize) -> bool {
        if self.backlog.len() >= limit {
            return false;
        }
        self.backlog.push_back(frame);
        true
    }

    pub fn take_backlog(&mut self) -> VecDeque<ServerFrame> {
        std::mem::take(&mut self.backlog)
    }

    pub fn replies(&mut self) -> &mut ReplyCache {
        &mut self.replies
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    /// First time this conversation arrives.
    New,
    /// Already handled, the reply is still on its way.
    InProgress,
    /// Already handled, this was the reply.
    Answered(ServerFrame),
}

/// Conversation ids a session has used, with the reply each one got.
#[derive(Debug)]
pub struct ReplyCache {
    replies: HashMap<ConversationId, Option<ServerFrame>>,
    order: VecDeque<ConversationId>,
    limit: usize,
}

impl Default for ReplyCache {
    fn default() -> Self {
        Self::with_limit(REPLY_CACHE_LIMIT)
    }
}

impl ReplyCache {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            replies: HashMap::new(),
            order: VecDeque::new(),
            limit,
        }
    }

    /// Look up `cid`, marking it in progress if it is new.
    pub fn check(&mut self, cid: ConversationId) -> Seen {
        match self.replies.get(&cid) {
            Some(Some(reply)) => Seen::Answered(reply.clone()),
            Some(None) => Seen::InProgress,
            None => {
                if self.order.len() >= self.limit {
                    self.evict_answered();
                }
                self.order.push_back(cid);
                self.replies.insert(cid, None);
                Seen::New
            }
        }
    }

    pub fn record(&mut self, cid: ConversationId, reply: &ServerFrame) {
        if let Some(slot) = self.replies.get_mut(&cid) {
            *slot = Some(reply.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Forget the oldest answered conversation, if there is one.
    fn evict_answered(&mut self) {
        let oldest = self
            .order
            .iter()
            .position(|cid| matches!(self.replies.get(cid), Some(Some(_))));
        if let Some(cid) = oldest.and_then(|position| self.order.remove(position)) {
            self.replies.remove(&cid);
        }
    }
}
