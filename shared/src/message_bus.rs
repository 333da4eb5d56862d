//! Gameplay message bus
//!
//! Channel-tag keyed publish/subscribe for decoupled gameplay systems (UI, analytics,
//! inventory). The bus is a cheap cloneable handle; components that publish are handed a
//! clone when they are constructed.
//!
//! A broadcast on `A.B.C` reaches exact listeners on `A.B.C` and partial-match listeners on
//! `A.B` and `A`.

use bevy::prelude::*;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::tags::GameplayTag;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MessageMatch {
    /// Only broadcasts on exactly this channel.
    #[default]
    ExactMatch,
    /// Broadcasts on this channel or any child channel.
    PartialMatch,
}

/// Returned by `register_listener`; pass back to `unregister_listener`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    pub channel: GameplayTag,
    pub id: u64,
}

type Callback = Arc<dyn Fn(&GameplayTag, &dyn Any) + Send + Sync>;

#[derive(Clone)]
struct ListenerData {
    id: u64,
    match_type: MessageMatch,
    type_id: TypeId,
    type_name: &'static str,
    callback: Callback,
}

#[derive(Default)]
struct ListenerMap {
    channels: HashMap<GameplayTag, Vec<ListenerData>>,
    next_id: u64,
}

#[derive(Resource, Clone, Default)]
pub struct GameplayMessageBus {
    inner: Arc<RwLock<ListenerMap>>,
    /// Set from the `log_messages` console variable.
    log_messages: Arc<AtomicI32>,
}

impl GameplayMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_log_messages(&self, level: i32) {
        self.log_messages.store(level, Ordering::Relaxed);
    }

    /// Register a typed listener.
    pub fn register_listener<T, F>(&self, channel: GameplayTag, match_type: MessageMatch, callback: F) -> ListenerHandle
    where
        T: Any,
        F: Fn(&GameplayTag, &T) + Send + Sync + 'static,
    {
        let erased: Callback = Arc::new(move |channel: &GameplayTag, payload: &dyn Any| {
            if let Some(message) = payload.downcast_ref::<T>() {
                callback(channel, message);
            }
        });
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.next_id += 1;
        let id = map.next_id;
        map.channels.entry(channel.clone()).or_default().push(ListenerData {
            id,
            match_type,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            callback: erased,
        });
        ListenerHandle { channel, id }
    }

    /// Register a listener that queues payloads for a system to drain later.
    pub fn register_inbox<T>(&self, channel: GameplayTag, match_type: MessageMatch) -> (ListenerHandle, MessageInbox<T>)
    where
        T: Any + Clone + Send + 'static,
    {
        let inbox = MessageInbox::<T>::default();
        let sink = inbox.clone();
        let handle = self.register_listener::<T, _>(channel, match_type, move |channel, message| {
            sink.push(channel.clone(), message.clone());
        });
        (handle, inbox)
    }

    pub fn unregister_listener(&self, handle: &ListenerHandle) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = map.channels.get_mut(&handle.channel) {
            list.retain(|l| l.id != handle.id);
            if list.is_empty() {
                map.channels.remove(&handle.channel);
            }
        }
    }

    /// Broadcast `message` on `channel` to every matching listener.
    pub fn broadcast_message<T: Any + Debug>(&self, channel: &GameplayTag, message: &T) {
        if self.log_messages.load(Ordering::Relaxed) != 0 {
            info!("BroadcastMessage({}, {:?})", channel, message);
        }

        // Snapshot listeners so callbacks may register or unregister freely
        let mut targets: Vec<(GameplayTag, ListenerData)> = Vec::new();
        {
            let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
            let mut on_initial_tag = true;
            for tag in channel.self_and_parents() {
                if let Some(list) = map.channels.get(&tag) {
                    for listener in list {
                        if on_initial_tag || listener.match_type == MessageMatch::PartialMatch {
                            targets.push((tag.clone(), listener.clone()));
                        }
                    }
                }
                on_initial_tag = false;
            }
        }

        for (listener_tag, listener) in targets {
            if listener.type_id != TypeId::of::<T>() {
                error!(
                    "Struct type mismatch on channel {} (broadcast type {}, listener at {} was expecting type {})",
                    channel,
                    std::any::type_name::<T>(),
                    listener_tag,
                    listener.type_name
                );
                continue;
            }
            (listener.callback)(channel, message as &dyn Any);
        }
    }

    pub fn listener_count(&self, channel: &GameplayTag) -> usize {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.channels.get(channel).map(|l| l.len()).unwrap_or(0)
    }
}

/// Shared queue filled by a bus listener.
#[derive(Clone)]
pub struct MessageInbox<T> {
    queue: Arc<Mutex<Vec<(GameplayTag, T)>>>,
}

impl<T> Default for MessageInbox<T> {
    fn default() -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T> MessageInbox<T> {
    fn push(&self, channel: GameplayTag, message: T) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).push((channel, message));
    }

    pub fn drain(&self) -> Vec<(GameplayTag, T)> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Generic "someone did something to someone" payload used by damage and elimination
/// channels.
#[derive(Clone, Debug, PartialEq)]
pub struct GameVerbMessage {
    pub verb: GameplayTag,
    pub instigator: Option<u64>,
    pub target: Option<u64>,
    pub magnitude: f32,
}
