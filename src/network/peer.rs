// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::Bytes;

/// Application side of a session.
///
/// Both callbacks run on the runtime's worker threads and must not block.
/// `on_message` is called from the session's receive path, in arrival order.
pub trait Peer: Send + Sync {
    fn on_message(&self, payload: Bytes);

    /// Called once, after the session's outbound queue has been dropped.
    fn on_removed(&self);
}
