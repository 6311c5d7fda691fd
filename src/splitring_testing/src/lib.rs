/*
Copyright 2026 The Splitring Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Test fixtures shared by the splitring integration tests, benches and
//! fuzz targets.

pub mod mock_transport;
pub mod shared_memory;
pub mod simplelogger;

pub use mock_transport::MockTransport;
pub use shared_memory::SharedMemory;
