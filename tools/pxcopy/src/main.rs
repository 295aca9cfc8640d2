// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! pxcopy: swap two files through a proxy instance.

fn main() -> std::process::ExitCode {
    pxcopy::cli::run()
}
