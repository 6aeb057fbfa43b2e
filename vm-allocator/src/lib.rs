// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Copyright © 2019 Intel Corporation
// SPDX-License-Identifier: Apache-2.0 OR MIT
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Manages the fixed-capacity tables the monitor allocates machines, vcpus
//! and memory segments from.

mod slot;

pub use crate::slot::{Error, Result, SlotTable};
