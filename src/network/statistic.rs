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

use std::fmt;
use std::ops::{Add, AddAssign};
use std::time::Duration;

/// Cumulative traffic and timing counters of one connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Statistic {
    pub send_byte_sum: u64,
    pub send_msg_sum: u64,
    /// Time messages waited in the send queue before their write was issued.
    pub send_delay_sum: Duration,
    /// Time from issuing a write to its completion.
    pub send_time_sum: Duration,

    pub recv_byte_sum: u64,
    pub recv_msg_sum: u64,
    /// Time the receive loop stayed paused on a full backlog.
    pub recv_idle_sum: Duration,
    /// Time spent inside the delivery hooks.
    pub handle_time_sum: Duration,
}

impl AddAssign for Statistic {
    fn add_assign(&mut self, other: Self) {
        self.send_byte_sum += other.send_byte_sum;
        self.send_msg_sum += other.send_msg_sum;
        self.send_delay_sum += other.send_delay_sum;
        self.send_time_sum += other.send_time_sum;
        self.recv_byte_sum += other.recv_byte_sum;
        self.recv_msg_sum += other.recv_msg_sum;
        self.recv_idle_sum += other.recv_idle_sum;
        self.handle_time_sum += other.handle_time_sum;
    }
}

impl Add for Statistic {
    type Output = Statistic;

    fn add(mut self, other: Self) -> Statistic {
        self += other;
        self
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "send corresponding statistic:\n\
             message sum: {}\n\
             size in bytes: {}\n\
             send delay: {:.3}s\n\
             send duration: {:.3}s\n\
             \n\
             recv corresponding statistic:\n\
             message sum: {}\n\
             size in bytes: {}\n\
             dispatch delay: {:.3}s\n\
             handle duration: {:.3}s",
            self.send_msg_sum,
            self.send_byte_sum,
            self.send_delay_sum.as_secs_f64(),
            self.send_time_sum.as_secs_f64(),
            self.recv_msg_sum,
            self.recv_byte_sum,
            self.recv_idle_sum.as_secs_f64(),
            self.handle_time_sum.as_secs_f64(),
        )
    }
}
