// Copyright 2024 The Mirrorlink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod cache;
pub mod file_info;
pub mod keys;
pub mod lock;
pub mod mirror;
pub mod pubsub;
pub mod redis_store;
pub mod upgrade;

pub use cache::MetadataCache;
pub use file_info::FileInfo;
pub use mirror::{Mirror, RedirectPolicy, ScanProtocol, SyncPrecision};
pub use pubsub::CatalogEvent;
pub use redis_store::CatalogStore;
